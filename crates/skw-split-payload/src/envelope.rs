use std::fmt;

use serde::{Deserialize, Serialize};

use crate::tensor::Tensor;
use crate::types::{Nonce, RoundId, SegmentId};

const TOPIC_PREFIX: &str = "skw-split";

/// which half of the round handshake an envelope belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    // activations, segment A -> segment B
    Forward,
    // gradients, segment B -> segment A
    Backward,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Forward => "forward",
            Self::Backward => "backward",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The unit exchanged over a message channel. Everything but `ciphertext`
/// is visible to the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub round_id: RoundId,
    pub direction: Direction,
    pub sender_id: SegmentId,

    // unique per sender, not a cryptographic nonce
    pub nonce: Nonce,
    pub ciphertext: Vec<u8>,
}

impl Envelope {
    pub fn new(
        round_id: RoundId,
        direction: Direction,
        sender_id: SegmentId,
        nonce: Nonce,
        ciphertext: Vec<u8>,
    ) -> Self {
        Self {
            round_id, direction, sender_id, nonce, ciphertext,
        }
    }

    /// the key a receiver deduplicates on
    pub fn dedup_key(&self) -> (RoundId, Direction, SegmentId) {
        (self.round_id, self.direction, self.sender_id.clone())
    }
}

/// The cleartext handed to the encryptor. The header is repeated inside the
/// ciphertext so that a receiver can tell whether the envelope around it
/// was rewritten.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SealedPayload {
    pub round_id: RoundId,
    pub direction: Direction,
    pub sender_id: SegmentId,

    pub body: Tensor,
}

impl SealedPayload {
    pub fn new(envelope_round: RoundId, direction: Direction, sender_id: SegmentId, body: Tensor) -> Self {
        Self {
            round_id: envelope_round, direction, sender_id, body,
        }
    }

    pub fn matches(&self, envelope: &Envelope) -> bool {
        self.round_id == envelope.round_id
            && self.direction == envelope.direction
            && self.sender_id == envelope.sender_id
    }
}

/// Channel address of one envelope. The round id is part of the key so
/// concurrent rounds never share a topic.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Topic {
    pub sender: SegmentId,
    pub receiver: SegmentId,
    pub round_id: RoundId,
    pub direction: Direction,
}

impl Topic {
    pub fn new(sender: SegmentId, receiver: SegmentId, round_id: RoundId, direction: Direction) -> Self {
        Self {
            sender, receiver, round_id, direction,
        }
    }

    pub fn key(&self) -> String {
        format!(
            "{}/{}/{}/{}/{}",
            TOPIC_PREFIX, self.sender, self.receiver, self.round_id, self.direction
        )
    }

    pub fn is_valid(&self) -> bool {
        self.sender.is_valid() && self.receiver.is_valid() && self.sender != self.receiver
    }

    /// whether an envelope's visible header fits this topic
    pub fn admits(&self, envelope: &Envelope) -> bool {
        envelope.round_id == self.round_id
            && envelope.direction == self.direction
            && envelope.sender_id == self.sender
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}
