//! Fault injection around any [`MessageChannel`].
//!
//! [`FlakyChannel`] reproduces what an unreliable transport does to a round:
//! transient send failures, outright rejection, silently lost messages,
//! bit flips in transit, and duplicate delivery through a side path.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use skw_split_payload::{Direction, Envelope, Topic};

use crate::channel::MessageChannel;
use crate::types::{ChannelError, MessageId};

type Tap = Box<dyn Fn(&Topic, &Envelope) + Send + Sync>;

pub struct FlakyChannel<C> {
    inner: C,

    failing_sends: AtomicUsize,
    failing_polls: AtomicUsize,
    reject_sends: bool,
    tamper: HashSet<Direction>,
    lose: HashSet<Direction>,
    tap: Option<Tap>,

    send_attempts: AtomicUsize,
    poll_attempts: AtomicUsize,
}

impl<C: MessageChannel> FlakyChannel<C> {
    pub fn new(inner: C) -> Self {
        Self {
            inner,
            failing_sends: AtomicUsize::new(0),
            failing_polls: AtomicUsize::new(0),
            reject_sends: false,
            tamper: HashSet::new(),
            lose: HashSet::new(),
            tap: None,
            send_attempts: AtomicUsize::new(0),
            poll_attempts: AtomicUsize::new(0),
        }
    }

    /// the next `k` sends fail with a transport error
    pub fn fail_sends(self, k: usize) -> Self {
        self.failing_sends.store(k, Ordering::SeqCst);
        self
    }

    /// the next `k` polls fail with a transport error
    pub fn fail_polls(self, k: usize) -> Self {
        self.failing_polls.store(k, Ordering::SeqCst);
        self
    }

    pub fn reject_sends(mut self) -> Self {
        self.reject_sends = true;
        self
    }

    /// flip one ciphertext bit of every envelope sent in `direction`
    pub fn tamper(mut self, direction: Direction) -> Self {
        self.tamper.insert(direction);
        self
    }

    /// report success for sends in `direction` but never publish them
    pub fn lose(mut self, direction: Direction) -> Self {
        self.lose.insert(direction);
        self
    }

    /// observe every envelope that actually gets published
    pub fn tap(mut self, tap: impl Fn(&Topic, &Envelope) + Send + Sync + 'static) -> Self {
        self.tap = Some(Box::new(tap));
        self
    }

    pub fn inner(&self) -> &C {
        &self.inner
    }

    pub fn send_attempts(&self) -> usize {
        self.send_attempts.load(Ordering::SeqCst)
    }

    pub fn poll_attempts(&self) -> usize {
        self.poll_attempts.load(Ordering::SeqCst)
    }

    fn take_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl<C: MessageChannel> MessageChannel for FlakyChannel<C> {
    async fn send(&self, topic: &Topic, mut envelope: Envelope) -> Result<MessageId, ChannelError> {
        self.send_attempts.fetch_add(1, Ordering::SeqCst);

        if self.reject_sends {
            return Err(ChannelError::Rejected("permission denied".to_string()));
        }
        if Self::take_failure(&self.failing_sends) {
            return Err(ChannelError::Transport("send timed out".to_string()));
        }
        if self.lose.contains(&envelope.direction) {
            return MessageId::of(topic, &envelope);
        }
        if self.tamper.contains(&envelope.direction) {
            if let Some(byte) = envelope.ciphertext.last_mut() {
                *byte ^= 0x01;
            }
        }

        let id = self.inner.send(topic, envelope.clone()).await?;
        if let Some(tap) = &self.tap {
            tap(topic, &envelope);
        }
        Ok(id)
    }

    async fn poll_latest(&self, topic: &Topic) -> Result<Option<Envelope>, ChannelError> {
        self.poll_attempts.fetch_add(1, Ordering::SeqCst);

        if Self::take_failure(&self.failing_polls) {
            return Err(ChannelError::Transport("poll timed out".to_string()));
        }
        self.inner.poll_latest(topic).await
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{InMemoryChannel, DEFAULT_MAX_PAYLOAD_BYTES};

    fn topic() -> Topic {
        Topic::new("subnet-a".into(), "subnet-b".into(), 1, Direction::Forward)
    }

    fn envelope() -> Envelope {
        Envelope::new(1, Direction::Forward, "subnet-a".into(), 0, vec![0u8; 16])
    }

    #[tokio::test]
    async fn transient_failures_run_out() {
        let channel = FlakyChannel::new(InMemoryChannel::spawn(DEFAULT_MAX_PAYLOAD_BYTES)).fail_sends(2);

        assert!(matches!(channel.send(&topic(), envelope()).await, Err(ChannelError::Transport(_))));
        assert!(matches!(channel.send(&topic(), envelope()).await, Err(ChannelError::Transport(_))));
        assert!(channel.send(&topic(), envelope()).await.is_ok());
        assert_eq!(channel.send_attempts(), 3);
    }

    #[tokio::test]
    async fn tampering_flips_a_bit() {
        let channel = FlakyChannel::new(InMemoryChannel::spawn(DEFAULT_MAX_PAYLOAD_BYTES))
            .tamper(Direction::Forward);
        channel.send(&topic(), envelope()).await.unwrap();

        let delivered = channel.poll_latest(&topic()).await.unwrap().unwrap();
        assert_ne!(delivered.ciphertext, envelope().ciphertext);
        assert_eq!(delivered.ciphertext[15], 0x01);
    }

    #[tokio::test]
    async fn lost_messages_never_arrive() {
        let channel = FlakyChannel::new(InMemoryChannel::spawn(DEFAULT_MAX_PAYLOAD_BYTES))
            .lose(Direction::Forward);
        assert!(channel.send(&topic(), envelope()).await.is_ok());
        assert_eq!(channel.poll_latest(&topic()).await, Ok(None));
    }
}
