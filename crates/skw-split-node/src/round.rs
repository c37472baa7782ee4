use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use skw_split_payload::RoundId;

use crate::error::{ErrorKind, SplitError};
use crate::runner::GradientSummary;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RoundPhase {
    AwaitingForward,
    ForwardSent,
    AwaitingBackward,
    BackwardSent,
    Complete,
    Failed,
}

impl RoundPhase {
    fn successor(&self) -> Option<RoundPhase> {
        match self {
            Self::AwaitingForward => Some(Self::ForwardSent),
            Self::ForwardSent => Some(Self::AwaitingBackward),
            Self::AwaitingBackward => Some(Self::BackwardSent),
            Self::BackwardSent => Some(Self::Complete),
            Self::Complete | Self::Failed => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }
}

impl fmt::Display for RoundPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Coordinator-side record of one round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Round {
    pub round_id: RoundId,
    phase: RoundPhase,
}

impl Round {
    pub fn new(round_id: RoundId) -> Self {
        Self { round_id, phase: RoundPhase::AwaitingForward }
    }

    pub fn phase(&self) -> RoundPhase {
        self.phase
    }

    /// Move to `next`. Only the linear order and failing from a live phase
    /// are allowed.
    pub fn advance(&mut self, next: RoundPhase) -> Result<(), SplitError> {
        let allowed = match next {
            RoundPhase::Failed => !self.phase.is_terminal(),
            _ => self.phase.successor() == Some(next),
        };
        if !allowed {
            return Err(SplitError::Protocol(format!(
                "round {} cannot move from {} to {}", self.round_id, self.phase, next
            )));
        }

        log::trace!("round {}: {} -> {}", self.round_id, self.phase, next);
        self.phase = next;
        Ok(())
    }
}

/// What a caller gets back from a round. A failed round carries the phase it
/// failed in; it is never resumed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RoundResult {
    Complete {
        round_id: RoundId,
        loss: f32,
        applied: GradientSummary,
    },
    Failed {
        round_id: RoundId,
        phase: RoundPhase,
        error: SplitError,
    },
}

impl RoundResult {
    pub fn round_id(&self) -> RoundId {
        match self {
            Self::Complete { round_id, .. } | Self::Failed { round_id, .. } => *round_id,
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(self, Self::Complete { .. })
    }

    pub fn failed(&self) -> Option<ErrorKind> {
        match self {
            Self::Failed { error, .. } => Some(error.kind()),
            Self::Complete { .. } => None,
        }
    }
}

/// Cloneable cancellation flag for a running round.
#[derive(Debug, Clone, Default)]
pub struct RoundCancel(Arc<AtomicBool>);

impl RoundCancel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub(crate) fn check(&self) -> Result<(), SplitError> {
        if self.is_cancelled() {
            return Err(SplitError::Cancelled);
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn linear_order() {
        let mut round = Round::new(1);
        round.advance(RoundPhase::ForwardSent).unwrap();
        round.advance(RoundPhase::AwaitingBackward).unwrap();
        round.advance(RoundPhase::BackwardSent).unwrap();
        round.advance(RoundPhase::Complete).unwrap();
        assert_eq!(round.phase(), RoundPhase::Complete);

        assert!(round.advance(RoundPhase::Failed).is_err());
    }

    #[test]
    fn skipping_is_a_protocol_error() {
        let mut round = Round::new(1);
        let res = round.advance(RoundPhase::BackwardSent);
        assert_eq!(res.unwrap_err().kind(), ErrorKind::Protocol);
        assert_eq!(round.phase(), RoundPhase::AwaitingForward);

        round.advance(RoundPhase::Failed).unwrap();
        assert!(round.advance(RoundPhase::ForwardSent).is_err());
    }

    #[test]
    fn cancel_is_shared() {
        let cancel = RoundCancel::new();
        let handle = cancel.clone();
        assert!(cancel.check().is_ok());

        handle.cancel();
        assert_eq!(cancel.check(), Err(SplitError::Cancelled));
    }

    #[test]
    fn result_accessors() {
        let failed = RoundResult::Failed {
            round_id: 4,
            phase: RoundPhase::ForwardSent,
            error: SplitError::Cancelled,
        };
        assert_eq!(failed.round_id(), 4);
        assert_eq!(failed.failed(), Some(ErrorKind::Cancelled));
        assert!(!failed.is_complete());
    }
}
