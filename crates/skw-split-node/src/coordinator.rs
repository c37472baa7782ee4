use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::time::{sleep, timeout_at, Instant};

use skw_split_channel::{MessageChannel, MessageId};
use skw_split_crypto::{ChaChaEncryptor, Encryptor};
use skw_split_payload::{Direction, Envelope, RoundId, Tensor, Topic};

use crate::compute::{Compute, Loss};
use crate::config::SplitConfig;
use crate::error::SplitError;
use crate::linear::MseLoss;
use crate::retry::{retry, Backoff};
use crate::round::{Round, RoundCancel, RoundPhase, RoundResult};
use crate::runner::{GradientSummary, StageRunner};

/// Drives rounds between segment A and segment B over a [`MessageChannel`].
/// Never looks inside a payload; it only moves envelopes and tracks phases.
pub struct RoundCoordinator {
    config: SplitConfig,

    a: Arc<StageRunner>,
    b: Arc<StageRunner>,
    channel: Arc<dyn MessageChannel>,
    loss: Arc<dyn Loss>,

    next_round: AtomicU64,
}

impl RoundCoordinator {
    pub fn new(
        config: SplitConfig,
        a: Arc<StageRunner>,
        b: Arc<StageRunner>,
        channel: Arc<dyn MessageChannel>,
        loss: Arc<dyn Loss>,
    ) -> Result<Self, SplitError> {
        config.validate()?;
        if a.segment() != &config.segment_a || b.segment() != &config.segment_b {
            return Err(SplitError::Configuration(format!(
                "runners serve {} and {}, config names {} and {}",
                a.segment(), b.segment(), config.segment_a, config.segment_b
            )));
        }
        if a.peer() != b.segment() || b.peer() != a.segment() {
            return Err(SplitError::Configuration("runners are not peered with each other".to_string()));
        }

        Ok(Self {
            config,
            a,
            b,
            channel,
            loss,
            next_round: AtomicU64::new(1),
        })
    }

    /// Build both runners from `config`: one ChaCha20-Poly1305 encryptor over
    /// the shared secret, parameters seeded from `config.seed`, MSE loss.
    pub fn from_config(
        config: SplitConfig,
        a_compute: Arc<dyn Compute>,
        b_compute: Arc<dyn Compute>,
        channel: Arc<dyn MessageChannel>,
    ) -> Result<Self, SplitError> {
        let encryptor: Arc<dyn Encryptor> = Arc::new(ChaChaEncryptor::new(&config.shared_secret));

        let a = Arc::new(StageRunner::new(
            config.segment_a.clone(),
            config.segment_b.clone(),
            a_compute,
            encryptor.clone(),
            config.seed,
        ));
        let b = Arc::new(StageRunner::new(
            config.segment_b.clone(),
            config.segment_a.clone(),
            b_compute,
            encryptor,
            config.seed.wrapping_add(1),
        ));

        Self::new(config, a, b, channel, Arc::new(MseLoss))
    }

    pub fn config(&self) -> &SplitConfig {
        &self.config
    }

    /// id the next round will get
    pub fn next_round_id(&self) -> RoundId {
        self.next_round.load(Ordering::SeqCst)
    }

    pub fn runner_a(&self) -> &Arc<StageRunner> {
        &self.a
    }

    pub fn runner_b(&self) -> &Arc<StageRunner> {
        &self.b
    }

    pub async fn run_round(&self, input: &Tensor, target: &Tensor) -> RoundResult {
        self.run_round_with_cancel(input, target, &RoundCancel::new()).await
    }

    pub async fn run_round_with_cancel(&self, input: &Tensor, target: &Tensor, cancel: &RoundCancel) -> RoundResult {
        let round_id = self.next_round.fetch_add(1, Ordering::SeqCst);
        let mut round = Round::new(round_id);
        log::debug!("round {} started", round_id);

        let result = match self.drive(&mut round, input, target, cancel).await {
            Ok((loss, applied)) => {
                log::info!("round {} complete, loss {:.6}, state version {}", round_id, loss, applied.version);
                RoundResult::Complete { round_id, loss, applied }
            }
            Err(error) => {
                let phase = round.phase();
                // a live round can always fail
                let _ = round.advance(RoundPhase::Failed);
                log::warn!("round {} failed at {}: {}", round_id, phase, error);
                RoundResult::Failed { round_id, phase, error }
            }
        };

        self.a.retire(round_id);
        self.b.retire(round_id);
        result
    }

    async fn drive(
        &self,
        round: &mut Round,
        input: &Tensor,
        target: &Tensor,
        cancel: &RoundCancel,
    ) -> Result<(f32, GradientSummary), SplitError> {
        let round_id = round.round_id;
        let forward_topic = Topic::new(self.a.segment().clone(), self.b.segment().clone(), round_id, Direction::Forward);
        let backward_topic = Topic::new(self.b.segment().clone(), self.a.segment().clone(), round_id, Direction::Backward);

        // A -> B
        cancel.check()?;
        let forward = self.a.produce_forward(round_id, input)?;
        self.deliver(&forward_topic, forward, cancel).await?;
        round.advance(RoundPhase::ForwardSent)?;

        let received = self.await_envelope(&forward_topic, cancel).await?;
        let decoded = match self.b.consume_forward(&received) {
            Ok(decoded) => decoded,
            Err(SplitError::DuplicateEnvelope { .. }) => {
                log::info!("round {}: forward envelope already consumed by {}, using cached activation", round_id, self.b.segment());
                self.b.cached_activation(round_id).ok_or_else(|| SplitError::Protocol(format!(
                    "round {}: forward envelope consumed but no activation cached", round_id
                )))?
            }
            Err(e) => return Err(e),
        };
        let signal = self.loss.compute(&decoded.output, target)?;
        round.advance(RoundPhase::AwaitingBackward)?;

        // B -> A
        cancel.check()?;
        let backward = self.b.produce_backward(round_id, &signal.error)?;
        self.deliver(&backward_topic, backward, cancel).await?;
        round.advance(RoundPhase::BackwardSent)?;

        let received = self.await_envelope(&backward_topic, cancel).await?;
        let applied = match self.a.consume_backward(&received) {
            Ok(decoded) => decoded.applied,
            Err(SplitError::DuplicateEnvelope { .. }) => {
                log::info!("round {}: backward envelope already applied by {}", round_id, self.a.segment());
                self.a.cached_gradients(round_id).ok_or_else(|| SplitError::Protocol(format!(
                    "round {}: backward envelope applied but no update recorded", round_id
                )))?
            }
            Err(e) => return Err(e),
        };

        // B trains on the round only once A has
        self.b.commit(round_id)?;
        round.advance(RoundPhase::Complete)?;

        Ok((signal.value, applied))
    }

    async fn deliver(&self, topic: &Topic, envelope: Envelope, cancel: &RoundCancel) -> Result<MessageId, SplitError> {
        let key = topic.key();
        let id = retry(&key, Backoff::from_config(&self.config), cancel, || {
            let envelope = envelope.clone();
            async move {
                self.channel.send(topic, envelope).await.map_err(SplitError::from)
            }
        }).await?;

        log::info!("round {} {} envelope published, message id {}", topic.round_id, topic.direction, id);
        Ok(id)
    }

    /// Poll `topic` every `poll_interval` until an envelope shows up or
    /// `poll_deadline` passes.
    async fn await_envelope(&self, topic: &Topic, cancel: &RoundCancel) -> Result<Envelope, SplitError> {
        let deadline = Instant::now() + self.config.poll_deadline;
        let timed_out = || SplitError::DeliveryTimeout {
            topic: topic.key(),
            waited_ms: self.config.poll_deadline.as_millis() as u64,
        };

        loop {
            cancel.check()?;

            let polled = timeout_at(deadline, self.channel.poll_latest(topic))
                .await
                .map_err(|_| timed_out())?;
            match polled {
                Ok(Some(envelope)) => {
                    if !topic.admits(&envelope) {
                        return Err(SplitError::Protocol(format!(
                            "envelope on {} carries round {} ({}) from {}",
                            topic, envelope.round_id, envelope.direction, envelope.sender_id
                        )));
                    }
                    return Ok(envelope);
                }
                Ok(None) => {}
                Err(e) => {
                    let e = SplitError::from(e);
                    if !e.kind().is_retryable() {
                        return Err(e);
                    }
                    log::debug!("polling {} failed: {}", topic, e);
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(timed_out());
            }
            sleep(self.config.poll_interval.min(deadline - now)).await;
        }
    }
}
