use serde::{Deserialize, Serialize};
use thiserror::Error;

use skw_split_channel::ChannelError;
use skw_split_crypto::{DecryptionError, EncryptionError};
use skw_split_payload::{Direction, PayloadError, RoundId};

/// Coarse classification of a [`SplitError`], what callers branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    Configuration,
    Transport,
    Rejected,
    Decryption,
    DuplicateEnvelope,
    Protocol,
    DeliveryTimeout,
    Compute,
    Cancelled,
}

impl ErrorKind {
    /// whether trying again (a send, or a whole fresh round) can help
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport | Self::DeliveryTimeout)
    }

    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Transport | Self::DuplicateEnvelope)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum SplitError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("rejected by transport: {0}")]
    Rejected(String),

    #[error("envelope failed integrity check: {0}")]
    Decryption(String),

    #[error("envelope for round {round_id} ({direction}) already processed")]
    DuplicateEnvelope {
        round_id: RoundId,
        direction: Direction,
    },

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("no envelope on {topic} within {waited_ms}ms")]
    DeliveryTimeout {
        topic: String,
        waited_ms: u64,
    },

    #[error("compute failed: {0}")]
    Compute(String),

    #[error("round cancelled by caller")]
    Cancelled,
}

impl SplitError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Configuration(_) => ErrorKind::Configuration,
            Self::Transport(_) => ErrorKind::Transport,
            Self::Rejected(_) => ErrorKind::Rejected,
            Self::Decryption(_) => ErrorKind::Decryption,
            Self::DuplicateEnvelope { .. } => ErrorKind::DuplicateEnvelope,
            Self::Protocol(_) => ErrorKind::Protocol,
            Self::DeliveryTimeout { .. } => ErrorKind::DeliveryTimeout,
            Self::Compute(_) => ErrorKind::Compute,
            Self::Cancelled => ErrorKind::Cancelled,
        }
    }
}

impl From<ChannelError> for SplitError {
    fn from(e: ChannelError) -> Self {
        match e {
            ChannelError::Transport(reason) => Self::Transport(reason),
            ChannelError::Rejected(reason) => Self::Rejected(reason),
        }
    }
}

impl From<DecryptionError> for SplitError {
    fn from(e: DecryptionError) -> Self {
        Self::Decryption(e.to_string())
    }
}

// a sealing failure leaves nothing on the wire, the segment cannot proceed
impl From<EncryptionError> for SplitError {
    fn from(e: EncryptionError) -> Self {
        Self::Compute(e.to_string())
    }
}

impl From<PayloadError> for SplitError {
    fn from(e: PayloadError) -> Self {
        match e {
            PayloadError::FailToEncode(reason) => Self::Compute(reason),
            // an authenticated plaintext that does not parse was not produced by our peer
            PayloadError::FailToDecode(reason) => Self::Decryption(reason),
        }
    }
}
