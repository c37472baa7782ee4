use async_trait::async_trait;
use skw_split_payload::{Envelope, Topic};

use crate::types::{ChannelError, MessageId};

/// At-least-once, unordered delivery of envelopes keyed by topic.
///
/// `poll_latest` may hand out the same envelope more than once and may skip
/// one that was superseded; callers deduplicate and never assume monotonic
/// delivery. "Nothing yet" is `Ok(None)`, not an error.
#[async_trait]
pub trait MessageChannel: Send + Sync {
    async fn send(&self, topic: &Topic, envelope: Envelope) -> Result<MessageId, ChannelError>;
    async fn poll_latest(&self, topic: &Topic) -> Result<Option<Envelope>, ChannelError>;
}
