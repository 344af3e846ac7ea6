//! Components to build a neural network

use std::sync::atomic::{self, AtomicUsize};

use rand::Rng;
use thiserror::Error;

use crate::tensor::{Tensor, TensorError};

/// Errors for the neural network
#[derive(Debug, Error)]
pub enum NNError {
    #[error("Input size mismatch, expected {expected} got {got}")]
    InputSizeMismatch { expected: usize, got: usize },
    #[error(transparent)]
    Tensor(#[from] TensorError),
}

/// Represents the torch.nn.Module. NNs should implement this trait.
/// <https://github.com/pytorch/pytorch/blob/v2.6.0/torch/nn/modules/module.py#L402>
pub trait Module {
    fn forward(&self, input: &Tensor) -> Result<Tensor, NNError>;

    /// Parameters keyed by a unique, stable name such as `conv1.weight`
    fn named_parameters(&self) -> Vec<(String, Tensor)>;

    fn parameters(&self) -> Vec<Tensor> {
        self.named_parameters()
            .into_iter()
            .map(|(_, p)| p)
            .collect()
    }

    fn zero_grad(&mut self) {
        for mut p in self.parameters() {
            p.zero_grad();
        }
    }
}

/// Names the parameters of a submodule `prefix.<name>`
pub fn prefixed(prefix: &str, module: &impl Module) -> Vec<(String, Tensor)> {
    module
        .named_parameters()
        .into_iter()
        .map(|(name, p)| (format!("{prefix}.{name}"), p))
        .collect()
}

// U(-1/sqrt(fan_in), 1/sqrt(fan_in)), the PyTorch default for conv and linear layers
fn uniform_init(rng: &mut impl Rng, fan_in: usize) -> impl FnMut() -> f32 + '_ {
    let bound = 1.0 / (fan_in.max(1) as f32).sqrt();
    move || rng.random_range(-bound..=bound)
}

/// 2D convolution over `[N, C, H, W]` inputs, without padding
pub struct Conv2d {
    weight: Tensor,
    bias: Tensor,
    in_channels: usize,
    stride: usize,
}

impl Conv2d {
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        stride: usize,
        rng: &mut impl Rng,
    ) -> Self {
        let fan_in = in_channels * kernel_size * kernel_size;
        let weight = Tensor::parameter_with(
            vec![out_channels, in_channels, kernel_size, kernel_size],
            uniform_init(rng, fan_in),
        );
        let bias = Tensor::parameter_with(vec![out_channels], uniform_init(rng, fan_in));
        Self {
            weight,
            bias,
            in_channels,
            stride,
        }
    }
}

impl Module for Conv2d {
    fn forward(&self, input: &Tensor) -> Result<Tensor, NNError> {
        let (_, channels, _, _) = input.dims4()?;
        if channels != self.in_channels {
            return Err(NNError::InputSizeMismatch {
                expected: self.in_channels,
                got: channels,
            });
        }
        Ok(input.conv2d(&self.weight, &self.bias, self.stride)?)
    }

    fn named_parameters(&self) -> Vec<(String, Tensor)> {
        vec![
            ("weight".to_string(), self.weight.clone()),
            ("bias".to_string(), self.bias.clone()),
        ]
    }
}

/// A fully connected layer of a neural network
pub struct Linear {
    weight: Tensor,
    bias: Tensor,
    n_inputs: usize,
    n_output_nans: AtomicUsize,
}

impl Linear {
    /// Creates a new layer with the given number of inputs and outputs
    pub fn new(n_inputs: usize, n_outputs: usize, rng: &mut impl Rng) -> Self {
        let weight =
            Tensor::parameter_with(vec![n_outputs, n_inputs], uniform_init(rng, n_inputs));
        let bias = Tensor::parameter_with(vec![n_outputs], uniform_init(rng, n_inputs));
        Self {
            weight,
            bias,
            n_inputs,
            n_output_nans: AtomicUsize::new(0),
        }
    }

    // Testing utility for a deterministic and simple layer
    #[cfg(test)]
    fn new_ones(n_inputs: usize, n_outputs: usize) -> Self {
        Self {
            weight: Tensor::parameter_with(vec![n_outputs, n_inputs], || 1.0),
            bias: Tensor::parameter_with(vec![n_outputs], || 1.0),
            n_inputs,
            n_output_nans: AtomicUsize::new(0),
        }
    }

    /// Number of NaN outputs of the last forward pass (used for debugging)
    pub fn n_output_nans(&self) -> usize {
        self.n_output_nans.load(atomic::Ordering::Relaxed)
    }
}

impl Module for Linear {
    /// Computes forward pass for a `[N, n_inputs]` batch
    fn forward(&self, input: &Tensor) -> Result<Tensor, NNError> {
        let got = input.shape().last().copied().unwrap_or_default();
        if got != self.n_inputs {
            return Err(NNError::InputSizeMismatch {
                expected: self.n_inputs,
                got,
            });
        }
        let output = input.linear(&self.weight, &self.bias)?;
        let n_output_nans = output.data().iter().filter(|v| v.is_nan()).count();
        self.n_output_nans
            .store(n_output_nans, atomic::Ordering::Relaxed);
        if n_output_nans > 0 {
            log::debug!("n_output_nans: {}", n_output_nans);
        }
        Ok(output)
    }

    fn named_parameters(&self) -> Vec<(String, Tensor)> {
        vec![
            ("weight".to_string(), self.weight.clone()),
            ("bias".to_string(), self.bias.clone()),
        ]
    }
}

/// Max pooling over square windows
pub struct MaxPool2d {
    kernel_size: usize,
    stride: usize,
}

impl MaxPool2d {
    pub fn new(kernel_size: usize, stride: usize) -> Self {
        Self {
            kernel_size,
            stride,
        }
    }
}

impl Module for MaxPool2d {
    fn forward(&self, input: &Tensor) -> Result<Tensor, NNError> {
        Ok(input.max_pool2d(self.kernel_size, self.stride)?)
    }

    fn named_parameters(&self) -> Vec<(String, Tensor)> {
        vec![]
    }
}

/// Applies ReLU to a tensor, works for arbitrary shapes
#[derive(Default)]
pub struct ReLU {
    n_dead_neurons: AtomicUsize,
}

impl ReLU {
    pub fn new() -> Self {
        Self {
            n_dead_neurons: AtomicUsize::new(0),
        }
    }

    /// Returns the number of dead neurons in the last forward pass (used for debugging)
    pub fn n_dead_neurons(&self) -> usize {
        self.n_dead_neurons.load(atomic::Ordering::Relaxed)
    }
}

impl Module for ReLU {
    fn forward(&self, input: &Tensor) -> Result<Tensor, NNError> {
        let n_dead_neurons = input.data().iter().filter(|v| **v <= 0.0).count();
        self.n_dead_neurons
            .store(n_dead_neurons, atomic::Ordering::Relaxed);
        Ok(input.relu())
    }

    fn named_parameters(&self) -> Vec<(String, Tensor)> {
        vec![]
    }
}

/// Applies log softmax over the classes of a `[N, C]` tensor
#[derive(Default)]
pub struct LogSoftmax {}

impl LogSoftmax {
    pub fn new() -> Self {
        Self {}
    }
}

impl Module for LogSoftmax {
    fn forward(&self, input: &Tensor) -> Result<Tensor, NNError> {
        Ok(input.log_softmax()?)
    }

    fn named_parameters(&self) -> Vec<(String, Tensor)> {
        vec![]
    }
}
