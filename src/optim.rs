//! Optimizer(s)

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::tensor::Tensor;

/// Errors when restoring an optimizer
#[derive(Debug, Error)]
pub enum OptimError {
    #[error("Expected {expected} state buffers, got {got}")]
    BufferCountMismatch { expected: usize, got: usize },
    #[error("State buffer {index} has {got} values but its parameter has {expected}")]
    BufferSizeMismatch {
        index: usize,
        expected: usize,
        got: usize,
    },
}

/// Serializable optimizer state, one buffer per parameter in `parameters()` order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerState {
    pub lr: f32,
    pub momentum: f32,
    pub buffers: Vec<Vec<f32>>,
}

/// Common interface for optimizers
/// Analogous to the torch.optim.Optimizer interface
/// <https://pytorch.org/docs/stable/optim.html#base-class>
pub trait Optim {
    /// Performs a single optimization step with accumulated gradients
    fn step(&mut self);
    /// Zeros gradients for all parameters
    fn zero_grad(&mut self);
    fn lr(&self) -> f32;
    fn set_lr(&mut self, lr: f32);
    fn state(&self) -> OptimizerState;
    fn load_state(&mut self, state: OptimizerState) -> Result<(), OptimError>;
}

/// SGD with momentum, `buf = momentum * buf + grad; p -= lr * buf`.
/// The buffers hold raw gradients, so a learning rate change applies to the accumulated
/// momentum from the next step on.
pub struct SGD {
    params: Vec<Tensor>,
    lr: f32,
    momentum: f32,
    // momentum buffer per parameter element
    velocity: Vec<Vec<f32>>,
}

impl SGD {
    pub fn new(params: Vec<Tensor>, lr: f32, momentum: f32) -> Self {
        let velocity = params.iter().map(|p| vec![0.0; p.numel()]).collect();
        Self {
            params,
            lr,
            momentum,
            velocity,
        }
    }

    #[cfg(test)]
    fn velocities(&self) -> &[Vec<f32>] {
        &self.velocity
    }
}

impl Optim for SGD {
    fn step(&mut self) {
        for (param, velocity) in self.params.iter().zip(self.velocity.iter_mut()) {
            let mut inner = param.0.borrow_mut();
            let inner = &mut *inner;
            if !inner.requires_grad {
                continue;
            }
            for ((p, g), v) in inner
                .data
                .iter_mut()
                .zip(inner.grad.iter())
                .zip(velocity.iter_mut())
            {
                *v = self.momentum * *v + g;
                *p -= self.lr * *v;
            }
        }
    }

    fn zero_grad(&mut self) {
        for param in self.params.iter_mut() {
            param.zero_grad();
        }
    }

    fn lr(&self) -> f32 {
        self.lr
    }

    fn set_lr(&mut self, lr: f32) {
        self.lr = lr;
    }

    fn state(&self) -> OptimizerState {
        OptimizerState {
            lr: self.lr,
            momentum: self.momentum,
            buffers: self.velocity.clone(),
        }
    }

    fn load_state(&mut self, state: OptimizerState) -> Result<(), OptimError> {
        if state.buffers.len() != self.params.len() {
            return Err(OptimError::BufferCountMismatch {
                expected: self.params.len(),
                got: state.buffers.len(),
            });
        }
        for (index, (param, buffer)) in self.params.iter().zip(&state.buffers).enumerate() {
            if param.numel() != buffer.len() {
                return Err(OptimError::BufferSizeMismatch {
                    index,
                    expected: param.numel(),
                    got: buffer.len(),
                });
            }
        }
        self.lr = state.lr;
        self.momentum = state.momentum;
        self.velocity = state.buffers;
        Ok(())
    }
}
