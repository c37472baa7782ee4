use std::fmt;

use blake2::{Blake2s256, Digest};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use skw_split_payload::{encode, CryptoHash, Envelope, Topic};

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum ChannelError {
    // timeouts, connectivity; worth another attempt
    #[error("transient transport failure: {0}")]
    Transport(String),

    // the transport refused the message outright
    #[error("rejected by transport: {0}")]
    Rejected(String),
}

impl ChannelError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

/// Content address of a published envelope.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(pub CryptoHash);

impl MessageId {
    pub fn of(topic: &Topic, envelope: &Envelope) -> Result<Self, ChannelError> {
        let encoded = encode(envelope)
            .map_err(|e| ChannelError::Rejected(e.to_string()))?;

        let mut hasher = Blake2s256::new();
        hasher.update(topic.key().as_bytes());
        hasher.update(&encoded);
        Ok(Self(hasher.finalize().into()))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", self.to_hex())
    }
}

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageId(0x{})", self.to_hex())
    }
}

#[cfg(test)]
mod test {
    use skw_split_payload::Direction;

    use super::*;

    #[test]
    fn message_id_depends_on_topic_and_envelope() {
        let topic = Topic::new("a".into(), "b".into(), 1, Direction::Forward);
        let envelope = Envelope::new(1, Direction::Forward, "a".into(), 0, vec![1, 2, 3]);

        let id = MessageId::of(&topic, &envelope).unwrap();
        assert_eq!(id, MessageId::of(&topic, &envelope).unwrap());

        let other_topic = Topic::new("a".into(), "b".into(), 2, Direction::Forward);
        assert_ne!(id, MessageId::of(&other_topic, &envelope).unwrap());

        let other_envelope = Envelope { nonce: 1, ..envelope };
        assert_ne!(id, MessageId::of(&topic, &other_envelope).unwrap());

        assert_eq!(id.to_string().len(), 2 + 64);
    }

    #[test]
    fn only_transport_is_retryable() {
        assert!(ChannelError::Transport("timeout".into()).is_retryable());
        assert!(!ChannelError::Rejected("bad topic".into()).is_retryable());
    }
}
