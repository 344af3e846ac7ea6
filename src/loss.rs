//! Loss function(s)

use crate::{nn::NNError, tensor::Tensor};

/// A criterion comparing the model output with integer class targets
pub trait Loss {
    fn call(&self, output: &Tensor, targets: &[usize]) -> Result<Tensor, NNError>;
}

/// Negative log likelihood between `[N, C]` log probabilities and class indices,
/// averaged over the batch
pub struct NLLLoss;

impl Loss for NLLLoss {
    fn call(&self, output: &Tensor, targets: &[usize]) -> Result<Tensor, NNError> {
        Ok(output.nll_loss(targets)?)
    }
}
