use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};

use skw_split_crypto::Encryptor;
use skw_split_payload::{decode, encode, Direction, Envelope, RoundId, SealedPayload, SegmentId, Tensor};

use crate::compute::{Compute, Gradients, Parameters};
use crate::error::SplitError;

/// Parameters of one segment. Never leaves its runner in cleartext.
#[derive(Debug, Clone, PartialEq)]
pub struct StageState {
    /// bumped by exactly one per applied update
    pub version: u64,
    pub params: Parameters,
}

/// Where one runner stands in one round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunnerPhase {
    /// nothing happened for this round yet
    Idle,
    /// forward envelope produced, backward not yet applied
    AwaitingPeerEnvelope,
    /// forward envelope consumed, backward not yet produced
    Consumed,
    /// this runner's envelopes for the round are out or applied
    Produced,
    /// dropped by the coordinator; late envelopes are absorbed
    Retired,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GradientSummary {
    /// state version after the update
    pub version: u64,
    pub l2_norm: f32,
    pub values: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DecodedActivation {
    pub round_id: RoundId,
    pub activation: Tensor,
    /// this segment's forward output on `activation`
    pub output: Tensor,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DecodedGradients {
    pub round_id: RoundId,
    pub gradient: Tensor,
    pub applied: GradientSummary,
}

#[derive(Default)]
struct RoundSlot {
    phase: Option<RunnerPhase>,

    // what this segment's forward pass ran on, and what it produced
    input: Option<Tensor>,
    output: Option<Tensor>,

    produced: HashMap<Direction, Envelope>,

    // own parameter gradients, held until the round commits
    pending: Option<Gradients>,
    applied: Option<GradientSummary>,
}

/// Per-round bookkeeping. Round ids start at 1; every id at or below
/// `retired_through` is retired, above it only the ids in `retired` are.
#[derive(Default)]
struct RunnerLedger {
    rounds: HashMap<RoundId, RoundSlot>,
    consumed: HashSet<(RoundId, Direction, SegmentId)>,
    retired_through: RoundId,
    retired: BTreeSet<RoundId>,
}

impl RunnerLedger {
    fn is_retired(&self, round_id: RoundId) -> bool {
        round_id <= self.retired_through || self.retired.contains(&round_id)
    }

    fn retire(&mut self, round_id: RoundId) {
        self.rounds.remove(&round_id);
        if self.is_retired(round_id) {
            return;
        }
        self.retired.insert(round_id);
        while self.retired.remove(&(self.retired_through + 1)) {
            self.retired_through += 1;
        }

        let (mark, retired) = (self.retired_through, &self.retired);
        self.consumed.retain(|(r, _, _)| *r > mark && !retired.contains(r));
        self.rounds.retain(|r, _| *r > mark);
    }

    fn check_not_retired(&self, round_id: RoundId) -> Result<(), SplitError> {
        if self.is_retired(round_id) {
            return Err(SplitError::Protocol(format!("round {} is retired", round_id)));
        }
        Ok(())
    }

    fn check_fresh(&self, envelope: &Envelope) -> Result<(), SplitError> {
        if self.is_retired(envelope.round_id) || self.consumed.contains(&envelope.dedup_key()) {
            return Err(SplitError::DuplicateEnvelope {
                round_id: envelope.round_id,
                direction: envelope.direction,
            });
        }
        Ok(())
    }
}

/// One side of the split pipeline: owns a compute capability and its
/// parameters, and turns tensors into envelopes and back.
pub struct StageRunner {
    segment: SegmentId,
    peer: SegmentId,

    compute: Arc<dyn Compute>,
    encryptor: Arc<dyn Encryptor>,

    // lock order: ledger before state
    state: RwLock<StageState>,
    ledger: Mutex<RunnerLedger>,
    next_nonce: AtomicU64,
}

impl StageRunner {
    pub fn new(
        segment: SegmentId,
        peer: SegmentId,
        compute: Arc<dyn Compute>,
        encryptor: Arc<dyn Encryptor>,
        seed: u64,
    ) -> Self {
        let params = compute.init(seed);
        Self {
            segment,
            peer,
            compute,
            encryptor,
            state: RwLock::new(StageState { version: 0, params }),
            ledger: Mutex::new(RunnerLedger::default()),
            next_nonce: AtomicU64::new(0),
        }
    }

    pub fn segment(&self) -> &SegmentId {
        &self.segment
    }

    pub fn peer(&self) -> &SegmentId {
        &self.peer
    }

    pub fn state_version(&self) -> u64 {
        self.read_state().version
    }

    /// local snapshot of the parameters
    pub fn parameters(&self) -> Parameters {
        self.read_state().params.clone()
    }

    pub fn phase(&self, round_id: RoundId) -> RunnerPhase {
        let ledger = self.ledger();
        if ledger.is_retired(round_id) {
            return RunnerPhase::Retired;
        }
        ledger.rounds
            .get(&round_id)
            .and_then(|slot| slot.phase)
            .unwrap_or(RunnerPhase::Idle)
    }

    /// What `consume_forward` returned for a round, if it succeeded before.
    pub fn cached_activation(&self, round_id: RoundId) -> Option<DecodedActivation> {
        let ledger = self.ledger();
        let slot = ledger.rounds.get(&round_id)?;
        if !ledger.consumed.contains(&(round_id, Direction::Forward, self.peer.clone())) {
            return None;
        }
        Some(DecodedActivation {
            round_id,
            activation: slot.input.clone()?,
            output: slot.output.clone()?,
        })
    }

    /// The update applied for a round, by `consume_backward` or `commit`,
    /// while the round is live.
    pub fn cached_gradients(&self, round_id: RoundId) -> Option<GradientSummary> {
        self.ledger().rounds.get(&round_id)?.applied
    }

    /// Run the forward pass on `input` and seal the result for the peer.
    /// Asking twice for the same round returns the same envelope.
    pub fn produce_forward(&self, round_id: RoundId, input: &Tensor) -> Result<Envelope, SplitError> {
        {
            let ledger = self.ledger();
            ledger.check_not_retired(round_id)?;
            if let Some(envelope) = ledger.rounds.get(&round_id).and_then(|s| s.produced.get(&Direction::Forward)) {
                return Ok(envelope.clone());
            }
            if ledger.consumed.contains(&(round_id, Direction::Forward, self.peer.clone())) {
                return Err(SplitError::Protocol(format!(
                    "{} already consumed the forward envelope of round {}", self.segment, round_id
                )));
            }
        }

        // read-only, runs concurrently with other rounds
        let output = self.compute.forward(&self.read_state().params, input)?;
        let envelope = self.seal(round_id, Direction::Forward, output)?;

        let mut ledger = self.ledger();
        ledger.check_not_retired(round_id)?;
        let slot = ledger.rounds.entry(round_id).or_default();
        if let Some(existing) = slot.produced.get(&Direction::Forward) {
            return Ok(existing.clone());
        }
        slot.input = Some(input.clone());
        slot.produced.insert(Direction::Forward, envelope.clone());
        slot.phase = Some(RunnerPhase::AwaitingPeerEnvelope);

        log::debug!("{} produced forward envelope for round {} (nonce {})", self.segment, round_id, envelope.nonce);
        Ok(envelope)
    }

    /// Open a forward envelope from the peer and run this segment's forward
    /// pass on it.
    pub fn consume_forward(&self, envelope: &Envelope) -> Result<DecodedActivation, SplitError> {
        {
            let ledger = self.ledger();
            self.check_incoming(envelope, Direction::Forward)?;
            ledger.check_fresh(envelope)?;
            if ledger.rounds.get(&envelope.round_id).map_or(false, |s| s.produced.contains_key(&Direction::Forward)) {
                return Err(SplitError::Protocol(format!(
                    "{} received a forward envelope for round {} it produced itself", self.segment, envelope.round_id
                )));
            }
        }

        let activation = self.open(envelope)?;
        let output = self.compute.forward(&self.read_state().params, &activation)?;

        let mut ledger = self.ledger();
        // a concurrent delivery of the same envelope may have won
        ledger.check_fresh(envelope)?;
        ledger.consumed.insert(envelope.dedup_key());
        let slot = ledger.rounds.entry(envelope.round_id).or_default();
        slot.input = Some(activation.clone());
        slot.output = Some(output.clone());
        slot.phase = Some(RunnerPhase::Consumed);

        log::debug!("{} consumed forward envelope for round {}", self.segment, envelope.round_id);
        Ok(DecodedActivation {
            round_id: envelope.round_id,
            activation,
            output,
        })
    }

    /// Back-propagate `error_signal` and seal the error at this segment's
    /// input for the peer. Parameters are left alone: the segment's own
    /// gradients wait for `commit`. A repeated request replays the cached
    /// envelope.
    pub fn produce_backward(&self, round_id: RoundId, error_signal: &Tensor) -> Result<Envelope, SplitError> {
        let mut ledger = self.ledger();
        ledger.check_not_retired(round_id)?;

        let consumed_forward = ledger.consumed.contains(&(round_id, Direction::Forward, self.peer.clone()));
        let slot = ledger.rounds.entry(round_id).or_default();
        if let Some(envelope) = slot.produced.get(&Direction::Backward) {
            return Ok(envelope.clone());
        }
        let input = match (&slot.input, consumed_forward) {
            (Some(input), true) => input.clone(),
            _ => return Err(SplitError::Protocol(format!(
                "backward for round {} requested before {} consumed its forward envelope", round_id, self.segment
            ))),
        };

        let grads = self.compute.gradient(&self.read_state().params, &input, error_signal)?;
        let envelope = self.seal(round_id, Direction::Backward, grads.input_error.clone())?;
        slot.produced.insert(Direction::Backward, envelope.clone());
        slot.pending = Some(grads);
        slot.phase = Some(RunnerPhase::Produced);

        log::debug!("{} produced backward envelope for round {} (nonce {})", self.segment, round_id, envelope.nonce);
        Ok(envelope)
    }

    /// Open a backward envelope from the peer and apply the resulting update.
    /// The only place parameters change because of a received message.
    pub fn consume_backward(&self, envelope: &Envelope) -> Result<DecodedGradients, SplitError> {
        {
            let ledger = self.ledger();
            self.check_incoming(envelope, Direction::Backward)?;
            ledger.check_fresh(envelope)?;
            Self::forward_input(&ledger, envelope.round_id)?;
        }

        let gradient = self.open(envelope)?;

        // applies are serialized per runner by the ledger lock
        let mut ledger = self.ledger();
        ledger.check_fresh(envelope)?;
        let input = Self::forward_input(&ledger, envelope.round_id)?;

        let applied = {
            let mut state = self.write_state();
            let grads = self.compute.gradient(&state.params, &input, &gradient)?;
            self.apply_locked(&mut state, &grads)?
        };

        ledger.consumed.insert(envelope.dedup_key());
        if let Some(slot) = ledger.rounds.get_mut(&envelope.round_id) {
            slot.applied = Some(applied);
            slot.phase = Some(RunnerPhase::Produced);
        }

        log::debug!(
            "{} applied backward envelope for round {}, state version {}",
            self.segment, envelope.round_id, applied.version
        );
        Ok(DecodedGradients {
            round_id: envelope.round_id,
            gradient,
            applied,
        })
    }

    /// Apply this segment's own gradients from `produce_backward` once the
    /// peer has applied the backward envelope. Committing twice returns the
    /// first result.
    pub fn commit(&self, round_id: RoundId) -> Result<GradientSummary, SplitError> {
        let mut ledger = self.ledger();
        ledger.check_not_retired(round_id)?;

        let slot = ledger.rounds
            .get_mut(&round_id)
            .filter(|slot| slot.produced.contains_key(&Direction::Backward))
            .ok_or_else(|| SplitError::Protocol(format!(
                "commit for round {} before {} produced its backward envelope", round_id, self.segment
            )))?;
        if let Some(applied) = slot.applied {
            return Ok(applied);
        }
        let applied = match &slot.pending {
            Some(grads) => self.apply_locked(&mut self.write_state(), grads)?,
            None => return Err(SplitError::Protocol(format!("round {} has no pending update", round_id))),
        };
        slot.pending = None;
        slot.applied = Some(applied);

        log::debug!("{} committed round {}, state version {}", self.segment, round_id, applied.version);
        Ok(applied)
    }

    /// Drop the per-round state. Anything that still arrives for the round
    /// is absorbed as a duplicate.
    pub fn retire(&self, round_id: RoundId) {
        self.ledger().retire(round_id);
    }

    fn apply_locked(&self, state: &mut StageState, grads: &Gradients) -> Result<GradientSummary, SplitError> {
        self.compute.apply(&mut state.params, grads)?;
        state.version += 1;
        Ok(GradientSummary {
            version: state.version,
            l2_norm: grads.l2_norm(),
            values: grads.value_count(),
        })
    }

    fn forward_input(ledger: &RunnerLedger, round_id: RoundId) -> Result<Tensor, SplitError> {
        ledger.rounds
            .get(&round_id)
            .filter(|slot| slot.produced.contains_key(&Direction::Forward))
            .and_then(|slot| slot.input.clone())
            .ok_or_else(|| SplitError::Protocol(format!(
                "backward envelope for round {} whose forward envelope was never produced here", round_id
            )))
    }

    fn check_incoming(&self, envelope: &Envelope, expected: Direction) -> Result<(), SplitError> {
        if envelope.direction != expected {
            return Err(SplitError::Protocol(format!(
                "expected a {} envelope, got {} for round {}", expected, envelope.direction, envelope.round_id
            )));
        }
        if envelope.sender_id != self.peer {
            return Err(SplitError::Protocol(format!(
                "envelope from {} but {} only accepts {}", envelope.sender_id, self.segment, self.peer
            )));
        }
        Ok(())
    }

    fn seal(&self, round_id: RoundId, direction: Direction, body: Tensor) -> Result<Envelope, SplitError> {
        let sealed = SealedPayload::new(round_id, direction, self.segment.clone(), body);
        let ciphertext = self.encryptor.encrypt(&encode(&sealed)?)?;
        let nonce = self.next_nonce.fetch_add(1, Ordering::SeqCst);

        Ok(Envelope::new(round_id, direction, self.segment.clone(), nonce, ciphertext))
    }

    fn open(&self, envelope: &Envelope) -> Result<Tensor, SplitError> {
        let plaintext = self.encryptor.decrypt(&envelope.ciphertext)?;
        let sealed: SealedPayload = decode(&plaintext)?;

        if !sealed.matches(envelope) {
            return Err(SplitError::Decryption(format!(
                "sealed header does not match envelope of round {} ({})", envelope.round_id, envelope.direction
            )));
        }
        if !sealed.body.is_well_formed() {
            return Err(SplitError::Protocol(format!("malformed tensor in round {}", envelope.round_id)));
        }
        Ok(sealed.body)
    }

    // no code path panics while holding these locks, poisoning carries no information
    fn ledger(&self) -> MutexGuard<'_, RunnerLedger> {
        self.ledger.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn read_state(&self) -> RwLockReadGuard<'_, StageState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, StageState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod test {
    use skw_split_crypto::{ChaChaEncryptor, SharedSecret};

    use super::*;
    use crate::compute::Loss;
    use crate::error::ErrorKind;
    use crate::linear::{MseLoss, PolynomialLinear};

    fn pair() -> (StageRunner, StageRunner) {
        let encryptor: Arc<dyn Encryptor> = Arc::new(ChaChaEncryptor::new(&SharedSecret::from_bytes([7u8; 32])));
        let a = StageRunner::new(
            "subnet-a".into(), "subnet-b".into(),
            Arc::new(PolynomialLinear::new(2, 3, 0.01)), encryptor.clone(), 1,
        );
        let b = StageRunner::new(
            "subnet-b".into(), "subnet-a".into(),
            Arc::new(PolynomialLinear::new(3, 1, 0.01)), encryptor, 2,
        );
        (a, b)
    }

    fn input() -> Tensor {
        Tensor::vector(vec![0.5, 0.2])
    }

    fn backward_for(b: &StageRunner, round_id: RoundId, decoded: &DecodedActivation) -> Envelope {
        let signal = MseLoss.compute(&decoded.output, &Tensor::vector(vec![1.0])).unwrap();
        b.produce_backward(round_id, &signal.error).unwrap()
    }

    #[test]
    fn full_handshake() {
        let (a, b) = pair();

        let forward = a.produce_forward(1, &input()).unwrap();
        assert_eq!(a.phase(1), RunnerPhase::AwaitingPeerEnvelope);

        let decoded = b.consume_forward(&forward).unwrap();
        assert_eq!(b.phase(1), RunnerPhase::Consumed);
        assert_eq!(decoded.output.len(), 1);

        let backward = backward_for(&b, 1, &decoded);
        assert_eq!(b.state_version(), 0);
        assert_eq!(b.phase(1), RunnerPhase::Produced);

        let applied = a.consume_backward(&backward).unwrap();
        assert_eq!(applied.applied.version, 1);
        assert_eq!(applied.gradient.len(), 3);
        assert_eq!(a.state_version(), 1);
        assert_eq!(a.phase(1), RunnerPhase::Produced);
        assert_eq!(a.cached_gradients(1), Some(applied.applied));

        let committed = b.commit(1).unwrap();
        assert_eq!(committed.version, 1);
        assert_eq!(b.state_version(), 1);
    }

    #[test]
    fn production_is_cached() {
        let (a, b) = pair();
        let forward = a.produce_forward(1, &input()).unwrap();
        assert_eq!(a.produce_forward(1, &input()).unwrap(), forward);
        assert_eq!(a.state_version(), 0);

        let decoded = b.consume_forward(&forward).unwrap();
        let params = b.parameters();
        let backward = backward_for(&b, 1, &decoded);
        assert_eq!(backward_for(&b, 1, &decoded), backward);
        // production never touches parameters
        assert_eq!(b.state_version(), 0);
        assert_eq!(b.parameters(), params);

        let first = b.commit(1).unwrap();
        assert_eq!(b.commit(1).unwrap(), first);
        assert_eq!(b.state_version(), 1);
        assert_ne!(b.parameters(), params);
    }

    #[test]
    fn commit_needs_a_produced_backward() {
        let (a, b) = pair();
        assert_eq!(b.commit(1).unwrap_err().kind(), ErrorKind::Protocol);

        let forward = a.produce_forward(1, &input()).unwrap();
        b.consume_forward(&forward).unwrap();
        assert_eq!(b.commit(1).unwrap_err().kind(), ErrorKind::Protocol);
        assert_eq!(a.commit(1).unwrap_err().kind(), ErrorKind::Protocol);

        // a retired round never commits
        let decoded = b.cached_activation(1).unwrap();
        backward_for(&b, 1, &decoded);
        b.retire(1);
        assert_eq!(b.commit(1).unwrap_err().kind(), ErrorKind::Protocol);
        assert_eq!(b.state_version(), 0);
    }

    #[test]
    fn retired_rounds_are_pruned() {
        let (a, b) = pair();
        let mut forwards = Vec::new();
        for round_id in 1..=50 {
            let forward = a.produce_forward(round_id, &input()).unwrap();
            b.consume_forward(&forward).unwrap();
            forwards.push(forward);
        }

        // out of order: nothing is pruned until round 1 retires
        for round_id in (2..=50).rev() {
            b.retire(round_id);
        }
        assert_eq!(b.ledger().retired.len(), 49);
        assert_eq!(b.ledger().consumed.len(), 1);

        b.retire(1);
        {
            let ledger = b.ledger();
            assert_eq!(ledger.retired_through, 50);
            assert!(ledger.retired.is_empty());
            assert!(ledger.consumed.is_empty());
            assert!(ledger.rounds.is_empty());
        }

        assert_eq!(b.phase(1), RunnerPhase::Retired);
        assert_eq!(b.phase(51), RunnerPhase::Idle);
        for forward in &forwards {
            assert_eq!(b.consume_forward(forward).unwrap_err().kind(), ErrorKind::DuplicateEnvelope);
        }
    }

    #[test]
    fn nonces_are_unique_per_sender() {
        let (a, _) = pair();
        let n1 = a.produce_forward(1, &input()).unwrap().nonce;
        let n2 = a.produce_forward(2, &input()).unwrap().nonce;
        assert_ne!(n1, n2);
    }

    #[test]
    fn duplicate_forward_is_ignored() {
        let (a, b) = pair();
        let forward = a.produce_forward(1, &input()).unwrap();

        let first = b.consume_forward(&forward).unwrap();
        let params = b.parameters();
        let res = b.consume_forward(&forward);
        assert_eq!(res.unwrap_err(), SplitError::DuplicateEnvelope { round_id: 1, direction: Direction::Forward });
        assert_eq!(b.parameters(), params);
        assert_eq!(b.cached_activation(1), Some(first));
    }

    #[test]
    fn duplicate_backward_applies_once() {
        let (a, b) = pair();
        let forward = a.produce_forward(1, &input()).unwrap();
        let decoded = b.consume_forward(&forward).unwrap();
        let backward = backward_for(&b, 1, &decoded);

        a.consume_backward(&backward).unwrap();
        let params = a.parameters();
        let res = a.consume_backward(&backward);
        assert_eq!(res.unwrap_err().kind(), ErrorKind::DuplicateEnvelope);
        assert_eq!(a.state_version(), 1);
        assert_eq!(a.parameters(), params);
    }

    #[test]
    fn backward_before_forward_is_a_protocol_error() {
        let (a, b) = pair();

        // b never consumed a forward envelope for round 1
        let res = b.produce_backward(1, &Tensor::vector(vec![0.1]));
        assert_eq!(res.unwrap_err().kind(), ErrorKind::Protocol);

        // a never produced the forward envelope for round 2
        let forward = a.produce_forward(1, &input()).unwrap();
        let decoded = b.consume_forward(&forward).unwrap();
        let mut backward = backward_for(&b, 1, &decoded);
        backward.round_id = 2;
        let res = a.consume_backward(&backward);
        assert_eq!(res.unwrap_err().kind(), ErrorKind::Protocol);
        assert_eq!(a.state_version(), 0);
    }

    #[test]
    fn wrong_direction_or_sender_is_a_protocol_error() {
        let (a, b) = pair();
        let forward = a.produce_forward(1, &input()).unwrap();

        assert_eq!(a.consume_backward(&forward).unwrap_err().kind(), ErrorKind::Protocol);
        assert_eq!(b.consume_backward(&forward).unwrap_err().kind(), ErrorKind::Protocol);

        let mut spoofed = forward.clone();
        spoofed.sender_id = "subnet-c".into();
        assert_eq!(b.consume_forward(&spoofed).unwrap_err().kind(), ErrorKind::Protocol);
    }

    #[test]
    fn tampered_forward_leaves_state_untouched() {
        let (a, b) = pair();
        let mut forward = a.produce_forward(1, &input()).unwrap();
        forward.ciphertext[20] ^= 0x04;

        let params = b.parameters();
        assert_eq!(b.consume_forward(&forward).unwrap_err().kind(), ErrorKind::Decryption);
        assert_eq!(b.parameters(), params);
        assert_eq!(b.state_version(), 0);
        assert_eq!(b.phase(1), RunnerPhase::Idle);
    }

    #[test]
    fn transplanted_ciphertext_is_detected() {
        let (a, b) = pair();
        let mut forward = a.produce_forward(1, &input()).unwrap();
        forward.round_id = 5;
        assert_eq!(b.consume_forward(&forward).unwrap_err().kind(), ErrorKind::Decryption);
    }

    #[test]
    fn retired_rounds_absorb_late_envelopes() {
        let (a, b) = pair();
        let forward = a.produce_forward(1, &input()).unwrap();
        a.retire(1);
        b.retire(1);

        assert_eq!(b.consume_forward(&forward).unwrap_err().kind(), ErrorKind::DuplicateEnvelope);
        assert_eq!(a.produce_forward(1, &input()).unwrap_err().kind(), ErrorKind::Protocol);
        assert_eq!(b.phase(1), RunnerPhase::Retired);
    }
}
