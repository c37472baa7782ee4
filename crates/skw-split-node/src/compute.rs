use serde::{Deserialize, Serialize};

use skw_split_payload::Tensor;

use crate::error::SplitError;

/// Parameter tensors of one segment, in the order its [`Compute`] defines.
pub type Parameters = Vec<Tensor>;

/// Result of back-propagating an output error through a segment.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Gradients {
    /// one gradient per parameter tensor, same order
    pub params: Vec<Tensor>,
    /// error with respect to the segment's input; what travels upstream
    pub input_error: Tensor,
}

impl Gradients {
    pub fn l2_norm(&self) -> f32 {
        self.params
            .iter()
            .map(|g| g.values.iter().map(|v| v * v).sum::<f32>())
            .sum::<f32>()
            .sqrt()
    }

    pub fn value_count(&self) -> usize {
        self.params.iter().map(Tensor::len).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LossSignal {
    pub value: f32,
    /// derivative of the loss with respect to the segment output
    pub error: Tensor,
}

/// The numeric half of a segment. The protocol never looks inside; it only
/// moves the tensors these functions produce.
pub trait Compute: Send + Sync {
    fn init(&self, seed: u64) -> Parameters;

    fn forward(&self, params: &Parameters, input: &Tensor) -> Result<Tensor, SplitError>;

    fn gradient(
        &self,
        params: &Parameters,
        input: &Tensor,
        output_error: &Tensor,
    ) -> Result<Gradients, SplitError>;

    fn apply(&self, params: &mut Parameters, grads: &Gradients) -> Result<(), SplitError>;
}

/// Compares a segment output with the caller-supplied target.
pub trait Loss: Send + Sync {
    fn compute(&self, output: &Tensor, target: &Tensor) -> Result<LossSignal, SplitError>;
}
