//! Transforms applied to every sample when it is fetched from a dataset

/// Mean pixel intensity of the MNIST training set, after scaling to `[0, 1]`
pub const MNIST_MEAN: f32 = 0.1307;
/// Standard deviation of the MNIST training set pixels, after scaling to `[0, 1]`
pub const MNIST_STD: f32 = 0.3081;

/// An 8 bit grayscale image, row major
#[derive(Debug, Clone, Copy)]
pub struct GrayImage<'a> {
    pub pixels: &'a [u8],
    pub height: usize,
    pub width: usize,
}

/// A `[C, H, W]` float image
#[derive(Debug, Clone, PartialEq)]
pub struct FloatImage {
    pub data: Vec<f32>,
    pub shape: [usize; 3],
}

/// A transform on float images
pub trait Transform: Send + Sync {
    fn apply(&self, image: FloatImage) -> FloatImage;
}

/// Converts pixels to `[1, H, W]` floats in `[0, 1]`
#[derive(Debug, Default, Clone, Copy)]
pub struct ToTensor;

impl ToTensor {
    pub fn apply(&self, image: GrayImage<'_>) -> FloatImage {
        FloatImage {
            data: image.pixels.iter().map(|&p| p as f32 / 255.0).collect(),
            shape: [1, image.height, image.width],
        }
    }
}

/// `(x - mean) / std` per channel. A single mean/std pair applies to every channel.
#[derive(Debug, Clone)]
pub struct Normalize {
    mean: Vec<f32>,
    std: Vec<f32>,
}

impl Normalize {
    pub fn new(mean: Vec<f32>, std: Vec<f32>) -> Self {
        Self { mean, std }
    }
}

impl Transform for Normalize {
    fn apply(&self, mut image: FloatImage) -> FloatImage {
        let plane = image.shape[1] * image.shape[2];
        if plane == 0 {
            return image;
        }
        for (channel, values) in image.data.chunks_mut(plane).enumerate() {
            let mean = self.mean.get(channel).or(self.mean.last()).copied();
            let std = self.std.get(channel).or(self.std.last()).copied();
            if let (Some(mean), Some(std)) = (mean, std) {
                values.iter_mut().for_each(|v| *v = (*v - mean) / std);
            }
        }
        image
    }
}

/// [`ToTensor`] followed by a chain of float transforms
pub struct Compose {
    to_tensor: ToTensor,
    transforms: Vec<Box<dyn Transform>>,
}

impl Compose {
    pub fn new(transforms: Vec<Box<dyn Transform>>) -> Self {
        Self {
            to_tensor: ToTensor,
            transforms,
        }
    }

    /// The normalization used for MNIST
    pub fn mnist() -> Self {
        Self::new(vec![Box::new(Normalize::new(
            vec![MNIST_MEAN],
            vec![MNIST_STD],
        ))])
    }

    pub fn apply(&self, image: GrayImage<'_>) -> FloatImage {
        let image = self.to_tensor.apply(image);
        self.transforms
            .iter()
            .fold(image, |image, transform| transform.apply(image))
    }
}
