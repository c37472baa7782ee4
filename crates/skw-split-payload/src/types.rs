use std::fmt;

use serde::{Deserialize, Serialize};

pub type RoundId = u64;
pub type Nonce = u64;
pub type CryptoHash = [u8; 32];

/// Name of one side of the split pipeline. Doubles as the sender id on
/// envelopes and as a path segment of a topic key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SegmentId(String);

impl SegmentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// a segment id must be usable as a single topic path component
    pub fn is_valid(&self) -> bool {
        !self.0.is_empty()
            && !self.0.contains('/')
            && !self.0.chars().any(char::is_whitespace)
    }
}

impl fmt::Display for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SegmentId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for SegmentId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[cfg(test)]
mod test {
    use super::SegmentId;

    #[test]
    fn segment_id_validity() {
        assert!(SegmentId::from("subnet-a").is_valid());
        assert!(!SegmentId::from("").is_valid());
        assert!(!SegmentId::from("a/b").is_valid());
        assert!(!SegmentId::from("a b").is_valid());
    }
}
