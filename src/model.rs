//! The MNIST classifier: two convolution + pooling stages followed by two fully connected layers

use rand::Rng;

use crate::{
    nn::{Conv2d, Linear, LogSoftmax, MaxPool2d, Module, NNError, ReLU, prefixed},
    tensor::Tensor,
};

pub const N_CLASSES: usize = 10;
/// Flattened size of the second pooling stage, `50` channels of `4x4`
const FLAT_FEATURES: usize = 4 * 4 * 50;

/// Takes `[N, 1, 28, 28]` images and outputs `[N, 10]` log probabilities
pub struct Net {
    conv1: Conv2d,
    conv1_relu: ReLU,
    conv2: Conv2d,
    conv2_relu: ReLU,
    pool: MaxPool2d,
    fc1: Linear,
    fc1_relu: ReLU,
    fc2: Linear,
    log_softmax: LogSoftmax,
}

impl Net {
    pub fn new(rng: &mut impl Rng) -> Self {
        Self {
            conv1: Conv2d::new(1, 20, 5, 1, rng),
            conv1_relu: ReLU::new(),
            conv2: Conv2d::new(20, 50, 5, 1, rng),
            conv2_relu: ReLU::new(),
            pool: MaxPool2d::new(2, 2),
            fc1: Linear::new(FLAT_FEATURES, 500, rng),
            fc1_relu: ReLU::new(),
            fc2: Linear::new(500, N_CLASSES, rng),
            log_softmax: LogSoftmax::new(),
        }
    }
}

impl Module for Net {
    fn forward(&self, input: &Tensor) -> Result<Tensor, NNError> {
        let x = self.conv1_relu.forward(&self.conv1.forward(input)?)?;
        let x = self.pool.forward(&x)?;
        let x = self.conv2_relu.forward(&self.conv2.forward(&x)?)?;
        let x = self.pool.forward(&x)?;
        let batch = x.numel() / FLAT_FEATURES;
        let x = x.reshape(vec![batch, FLAT_FEATURES])?;
        let x = self.fc1_relu.forward(&self.fc1.forward(&x)?)?;
        let out = self.log_softmax.forward(&self.fc2.forward(&x)?)?;
        log::trace!(
            "dead units conv1: {}, conv2: {}, fc1: {}",
            self.conv1_relu.n_dead_neurons(),
            self.conv2_relu.n_dead_neurons(),
            self.fc1_relu.n_dead_neurons()
        );
        Ok(out)
    }

    fn named_parameters(&self) -> Vec<(String, Tensor)> {
        prefixed("conv1", &self.conv1)
            .into_iter()
            .chain(prefixed("conv2", &self.conv2))
            .chain(prefixed("fc1", &self.fc1))
            .chain(prefixed("fc2", &self.fc2))
            .collect()
    }
}
