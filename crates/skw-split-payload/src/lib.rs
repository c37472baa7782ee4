pub mod codec;
pub mod envelope;
pub mod tensor;
pub mod types;

// re-export
pub use crate::codec::{decode, encode, PayloadError};
pub use crate::envelope::{Direction, Envelope, SealedPayload, Topic};
pub use crate::tensor::Tensor;
pub use crate::types::{CryptoHash, Nonce, RoundId, SegmentId};
