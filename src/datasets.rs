//! Datasets with indexed access to samples, and the MNIST adapter
//!
//! MNIST is read from the IDX files in `<data_dir>/MNIST/raw/`, either plain or gzip compressed.
//! The files are downloaded from a public mirror when missing and downloading is enabled.

use std::{
    fs,
    io::{self, Read},
    path::{Path, PathBuf},
};

use flate2::read::GzDecoder;
use thiserror::Error;

use crate::transforms::{Compose, GrayImage};

const MNIST_MIRROR: &str = "https://ossci-datasets.s3.amazonaws.com/mnist/";
const IMAGES_MAGIC: u32 = 0x0000_0803;
const LABELS_MAGIC: u32 = 0x0000_0801;
const MNIST_CLASSES: u8 = 10;

/// Errors for loading and indexing datasets
#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("Failed to access '{path}'")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Dataset file '{path}' not found, enable downloading or place the IDX files there")]
    Missing { path: PathBuf },
    #[error("Failed to download '{url}'")]
    Download {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("'{path}' has magic number {got:#010x}, expected {expected:#010x}")]
    InvalidMagic {
        path: PathBuf,
        expected: u32,
        got: u32,
    },
    #[error("'{path}' declares {count} items of {rows}x{cols}, which does not fit in memory")]
    InvalidHeader {
        path: PathBuf,
        count: usize,
        rows: usize,
        cols: usize,
    },
    #[error("'{path}' is truncated, expected {expected} bytes, got {got}")]
    Truncated {
        path: PathBuf,
        expected: usize,
        got: usize,
    },
    #[error("Found {images} images but {labels} labels")]
    LengthMismatch { images: usize, labels: usize },
    #[error("Label {label} of sample {index} is not a valid class")]
    InvalidLabel { index: usize, label: u8 },
    #[error("Index {index} out of range for dataset of length {len}")]
    IndexOutOfRange { index: usize, len: usize },
}

/// A transformed sample and its class
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    /// `[C, H, W]` values
    pub data: Vec<f32>,
    pub shape: [usize; 3],
    pub target: usize,
}

/// Represents the torch.utils.data.Dataset: a fixed number of samples accessible by index.
/// Datasets are shared with the data loading workers, hence `Send + Sync`.
pub trait Dataset: Send + Sync {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn get(&self, index: usize) -> Result<Sample, DatasetError>;
}

/// Images of an IDX3 file
#[derive(Debug, Clone)]
pub struct IdxImages {
    pub rows: usize,
    pub cols: usize,
    /// `count * rows * cols` pixels
    pub pixels: Vec<u8>,
}

impl IdxImages {
    pub fn len(&self) -> usize {
        self.rows
            .checked_mul(self.cols)
            .and_then(|size| self.pixels.len().checked_div(size))
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The MNIST handwritten digits, normalized on access
pub struct MnistDataset {
    images: IdxImages,
    labels: Vec<u8>,
    transforms: Compose,
}

impl MnistDataset {
    /// Loads the training (`is_train`) or test split from `data_dir`
    pub fn new(
        data_dir: impl AsRef<Path>,
        is_train: bool,
        download: bool,
    ) -> Result<Self, DatasetError> {
        let raw_dir = data_dir.as_ref().join("MNIST").join("raw");
        let prefix = if is_train { "train" } else { "t10k" };
        let images_name = format!("{prefix}-images-idx3-ubyte");
        let labels_name = format!("{prefix}-labels-idx1-ubyte");

        let images_path = locate_or_download(&raw_dir, &images_name, download)?;
        let labels_path = locate_or_download(&raw_dir, &labels_name, download)?;
        let images = parse_idx_images(&read_file(&images_path)?, &images_path)?;
        let labels = parse_idx_labels(&read_file(&labels_path)?, &labels_path)?;
        let dataset = Self::from_raw(images, labels)?;
        log::info!(
            "Loaded {} MNIST {} samples from '{}'",
            dataset.len(),
            if is_train { "train" } else { "test" },
            raw_dir.display()
        );
        Ok(dataset)
    }

    /// Builds the dataset from decoded images and labels
    pub fn from_raw(images: IdxImages, labels: Vec<u8>) -> Result<Self, DatasetError> {
        if images.len() != labels.len() {
            return Err(DatasetError::LengthMismatch {
                images: images.len(),
                labels: labels.len(),
            });
        }
        if let Some((index, &label)) = labels
            .iter()
            .enumerate()
            .find(|(_, l)| **l >= MNIST_CLASSES)
        {
            return Err(DatasetError::InvalidLabel { index, label });
        }
        Ok(Self {
            images,
            labels,
            transforms: Compose::mnist(),
        })
    }

    /// Replaces the default normalization
    pub fn with_transforms(mut self, transforms: Compose) -> Self {
        self.transforms = transforms;
        self
    }
}

impl Dataset for MnistDataset {
    fn len(&self) -> usize {
        self.labels.len()
    }

    fn get(&self, index: usize) -> Result<Sample, DatasetError> {
        let target = *self
            .labels
            .get(index)
            .ok_or(DatasetError::IndexOutOfRange {
                index,
                len: self.len(),
            })?;
        let size = self.images.rows * self.images.cols;
        let image = GrayImage {
            pixels: &self.images.pixels[index * size..(index + 1) * size],
            height: self.images.rows,
            width: self.images.cols,
        };
        let image = self.transforms.apply(image);
        Ok(Sample {
            data: image.data,
            shape: image.shape,
            target: target as usize,
        })
    }
}

fn read_u32(bytes: &[u8], offset: usize, path: &Path) -> Result<u32, DatasetError> {
    bytes
        .get(offset..offset + 4)
        .and_then(|b| b.try_into().ok())
        .map(u32::from_be_bytes)
        .ok_or_else(|| DatasetError::Truncated {
            path: path.to_path_buf(),
            expected: offset + 4,
            got: bytes.len(),
        })
}

fn check_magic(bytes: &[u8], expected: u32, path: &Path) -> Result<(), DatasetError> {
    let got = read_u32(bytes, 0, path)?;
    if got != expected {
        return Err(DatasetError::InvalidMagic {
            path: path.to_path_buf(),
            expected,
            got,
        });
    }
    Ok(())
}

fn payload(bytes: &[u8], header: usize, len: usize, path: &Path) -> Result<Vec<u8>, DatasetError> {
    let truncated = || DatasetError::Truncated {
        path: path.to_path_buf(),
        expected: header.saturating_add(len),
        got: bytes.len(),
    };
    let end = header.checked_add(len).ok_or_else(truncated)?;
    bytes
        .get(header..end)
        .map(<[u8]>::to_vec)
        .ok_or_else(truncated)
}

/// Decodes an IDX3 (`u8`, 3 dimensions) file; `path` is only used for errors
pub fn parse_idx_images(bytes: &[u8], path: &Path) -> Result<IdxImages, DatasetError> {
    check_magic(bytes, IMAGES_MAGIC, path)?;
    let count = read_u32(bytes, 4, path)? as usize;
    let rows = read_u32(bytes, 8, path)? as usize;
    let cols = read_u32(bytes, 12, path)? as usize;
    let len = count
        .checked_mul(rows)
        .and_then(|n| n.checked_mul(cols))
        .ok_or_else(|| DatasetError::InvalidHeader {
            path: path.to_path_buf(),
            count,
            rows,
            cols,
        })?;
    let pixels = payload(bytes, 16, len, path)?;
    Ok(IdxImages { rows, cols, pixels })
}

/// Decodes an IDX1 (`u8`, 1 dimension) file; `path` is only used for errors
pub fn parse_idx_labels(bytes: &[u8], path: &Path) -> Result<Vec<u8>, DatasetError> {
    check_magic(bytes, LABELS_MAGIC, path)?;
    let count = read_u32(bytes, 4, path)? as usize;
    payload(bytes, 8, count, path)
}

/// Reads a file, decompressing it when it ends in `.gz`
fn read_file(path: &Path) -> Result<Vec<u8>, DatasetError> {
    let io_err = |source| DatasetError::Io {
        path: path.to_path_buf(),
        source,
    };
    let raw = fs::read(path).map_err(io_err)?;
    if path.extension().is_some_and(|ext| ext == "gz") {
        let mut bytes = Vec::new();
        GzDecoder::new(raw.as_slice())
            .read_to_end(&mut bytes)
            .map_err(io_err)?;
        Ok(bytes)
    } else {
        Ok(raw)
    }
}

/// Finds `name` or `name.gz` in `raw_dir`, downloading the archive when allowed
fn locate_or_download(raw_dir: &Path, name: &str, download: bool) -> Result<PathBuf, DatasetError> {
    let plain = raw_dir.join(name);
    let gz = raw_dir.join(format!("{name}.gz"));
    if plain.is_file() {
        return Ok(plain);
    }
    if gz.is_file() {
        return Ok(gz);
    }
    if !download {
        return Err(DatasetError::Missing { path: plain });
    }
    download_file(&format!("{MNIST_MIRROR}{name}.gz"), &gz)?;
    Ok(gz)
}

fn download_file(url: &str, dest: &Path) -> Result<(), DatasetError> {
    let io_err = |source| DatasetError::Io {
        path: dest.to_path_buf(),
        source,
    };
    log::info!("Downloading '{}' to '{}'", url, dest.display());
    let bytes = reqwest::blocking::get(url)
        .and_then(|response| response.error_for_status())
        .and_then(|response| response.bytes())
        .map_err(|source| DatasetError::Download {
            url: url.to_string(),
            source,
        })?;
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).map_err(io_err)?;
    }
    // an interrupted download must not leave a file that looks complete
    let partial = dest.with_extension("gz.part");
    fs::write(&partial, &bytes).map_err(io_err)?;
    fs::rename(&partial, dest).map_err(io_err)?;
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use std::io::Write;

    use flate2::{Compression, write::GzEncoder};
    use tempfile::TempDir;

    use crate::{assert_eq_float, transforms::MNIST_MEAN, transforms::MNIST_STD};

    use super::*;

    pub(crate) fn idx_images(
        count: usize,
        rows: usize,
        cols: usize,
        fill: impl Fn(usize) -> u8,
    ) -> Vec<u8> {
        let mut bytes = Vec::new();
        for v in [IMAGES_MAGIC, count as u32, rows as u32, cols as u32] {
            bytes.extend_from_slice(&v.to_be_bytes());
        }
        bytes.extend((0..count * rows * cols).map(fill));
        bytes
    }

    pub(crate) fn idx_labels(labels: &[u8]) -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&LABELS_MAGIC.to_be_bytes());
        bytes.extend_from_slice(&(labels.len() as u32).to_be_bytes());
        bytes.extend_from_slice(labels);
        bytes
    }

    /// A small dataset of `count` 28x28 images whose label is `index % 10`
    pub(crate) fn synthetic_mnist(count: usize) -> MnistDataset {
        let bytes = idx_images(count, 28, 28, |i| ((i * 7) % 256) as u8);
        let images = parse_idx_images(&bytes, Path::new("images")).unwrap();
        let labels = (0..count).map(|i| (i % 10) as u8).collect();
        MnistDataset::from_raw(images, labels).unwrap()
    }

    #[test]
    fn test_parse_idx() {
        let path = Path::new("images");
        let images = parse_idx_images(&idx_images(3, 2, 2, |i| i as u8), path).unwrap();
        assert_eq!(images.len(), 3);
        assert_eq!((images.rows, images.cols), (2, 2));
        assert_eq!(images.pixels, (0..12).collect::<Vec<u8>>());

        let labels = parse_idx_labels(&idx_labels(&[1, 2, 3]), path).unwrap();
        assert_eq!(labels, vec![1, 2, 3]);
    }

    #[test]
    fn test_parse_idx_errors() {
        let path = Path::new("labels");
        let err = parse_idx_images(&idx_labels(&[1]), path).unwrap_err();
        assert!(matches!(
            err,
            DatasetError::InvalidMagic {
                expected: IMAGES_MAGIC,
                got: LABELS_MAGIC,
                ..
            }
        ));

        let mut bytes = idx_images(2, 2, 2, |_| 0);
        bytes.truncate(bytes.len() - 1);
        let err = parse_idx_images(&bytes, path).unwrap_err();
        assert!(matches!(
            err,
            DatasetError::Truncated {
                expected: 24,
                got: 23,
                ..
            }
        ));

        let err = parse_idx_labels(&[0, 0], path).unwrap_err();
        assert!(matches!(err, DatasetError::Truncated { .. }));
    }

    #[test]
    fn test_parse_idx_oversized_header() {
        let path = Path::new("images");
        let mut bytes = Vec::new();
        for v in [IMAGES_MAGIC, u32::MAX, u32::MAX, u32::MAX] {
            bytes.extend_from_slice(&v.to_be_bytes());
        }
        let err = parse_idx_images(&bytes, path).unwrap_err();
        assert!(matches!(err, DatasetError::InvalidHeader { .. }));

        // a size that fits but is larger than the file
        let mut bytes = Vec::new();
        for v in [IMAGES_MAGIC, u32::MAX, 1, 1] {
            bytes.extend_from_slice(&v.to_be_bytes());
        }
        let err = parse_idx_images(&bytes, path).unwrap_err();
        assert!(matches!(err, DatasetError::Truncated { got: 16, .. }));

        let images = IdxImages {
            rows: usize::MAX,
            cols: 2,
            pixels: vec![0; 4],
        };
        assert_eq!(images.len(), 0);
    }

    #[test]
    fn test_from_raw_checks() {
        let images = parse_idx_images(&idx_images(2, 1, 1, |_| 0), Path::new("x")).unwrap();
        let err = MnistDataset::from_raw(images.clone(), vec![1]).err().unwrap();
        assert!(matches!(
            err,
            DatasetError::LengthMismatch {
                images: 2,
                labels: 1
            }
        ));
        let err = MnistDataset::from_raw(images, vec![1, 10]).err().unwrap();
        assert!(matches!(
            err,
            DatasetError::InvalidLabel {
                index: 1,
                label: 10
            }
        ));
    }

    #[test]
    fn test_get() {
        let dataset = synthetic_mnist(12);
        assert_eq!(dataset.len(), 12);
        let sample = dataset.get(11).unwrap();
        assert_eq!(sample.target, 1);
        assert_eq!(sample.shape, [1, 28, 28]);
        assert_eq!(sample.data.len(), 28 * 28);
        // the first pixel of image 11 is (11 * 784 * 7) % 256
        let pixel = ((11 * 784 * 7) % 256) as f32 / 255.0;
        assert_eq_float!(sample.data[0], (pixel - MNIST_MEAN) / MNIST_STD, 1e-5);

        let err = dataset.get(12).unwrap_err();
        assert!(matches!(
            err,
            DatasetError::IndexOutOfRange { index: 12, len: 12 }
        ));
        // the length is fixed
        assert_eq!(dataset.len(), 12);
    }

    #[test]
    fn test_load_from_dir() {
        let dir = TempDir::new().unwrap();
        let raw = dir.path().join("MNIST").join("raw");
        fs::create_dir_all(&raw).unwrap();
        fs::write(
            raw.join("t10k-images-idx3-ubyte"),
            idx_images(4, 28, 28, |_| 255),
        )
        .unwrap();
        // labels are gzip compressed
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&idx_labels(&[3, 1, 4, 1])).unwrap();
        fs::write(
            raw.join("t10k-labels-idx1-ubyte.gz"),
            encoder.finish().unwrap(),
        )
        .unwrap();

        let dataset = MnistDataset::new(dir.path(), false, false).unwrap();
        assert_eq!(dataset.len(), 4);
        assert_eq!(dataset.get(2).unwrap().target, 4);

        let err = MnistDataset::new(dir.path(), true, false).err().unwrap();
        assert!(matches!(err, DatasetError::Missing { .. }));
    }
}
