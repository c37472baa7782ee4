pub mod error;
pub mod config;
pub mod compute;
pub mod linear;
pub mod runner;
pub mod round;
pub mod retry;
pub mod coordinator;


// re-exports - traits
pub use compute::{Compute, Loss};

// re-exports
pub use config::{RawConfig, SplitConfig};
pub use compute::{Gradients, LossSignal, Parameters};
pub use coordinator::RoundCoordinator;
pub use error::{ErrorKind, SplitError};
pub use linear::{MseLoss, PolynomialLinear};
pub use retry::{retry, Backoff};
pub use round::{Round, RoundCancel, RoundPhase, RoundResult};
pub use runner::{DecodedActivation, DecodedGradients, GradientSummary, RunnerPhase, StageRunner, StageState};
