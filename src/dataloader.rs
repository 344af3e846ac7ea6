//! Data loader

use std::sync::Arc;

use rand::{Rng, SeedableRng, seq::SliceRandom};
use rand_pcg::Pcg64Mcg;
use rayon::{ThreadPool, ThreadPoolBuilder, prelude::*};
use thiserror::Error;

use crate::{
    datasets::{Dataset, DatasetError, Sample},
    tensor::{Tensor, TensorError},
};

/// Errors for the dataloader
#[derive(Debug, Error)]
pub enum DataLoaderError {
    #[error("Batch size must be positive")]
    ZeroBatchSize,
    #[error("At least one dataset is required")]
    NoDatasets,
    #[error("All samples of a batch must have the same shape, got {first:?} and {other:?}")]
    SampleShapeMismatch { first: [usize; 3], other: [usize; 3] },
    #[error("Failed to start {num_workers} loader workers")]
    Workers {
        num_workers: usize,
        #[source]
        source: rayon::ThreadPoolBuildError,
    },
    #[error(transparent)]
    Dataset(#[from] DatasetError),
    #[error(transparent)]
    Tensor(#[from] TensorError),
}

/// A collated mini batch
#[derive(Debug, PartialEq)]
pub struct Batch {
    /// `[B, C, H, W]` inputs
    pub data: Tensor,
    pub target: Vec<usize>,
}

/// Data loader, returns batches of samples optionally shuffled, from one or more datasets
/// which are concatenated. Takes inspiration from the PyTorch DataLoader
/// <https://pytorch.org/docs/stable/data.html#torch.utils.data.DataLoader>
pub struct DataLoader {
    datasets: Vec<Arc<dyn Dataset>>,
    // start index of each dataset in the concatenation
    offsets: Vec<usize>,
    len: usize,
    batch_size: usize,
    shuffle: bool,
    drop_last: bool,
    // `None` loads samples on the calling thread
    workers: Option<ThreadPool>,
}

impl DataLoader {
    pub fn new(
        datasets: Vec<Arc<dyn Dataset>>,
        batch_size: usize,
        num_workers: usize,
    ) -> Result<Self, DataLoaderError> {
        if batch_size == 0 {
            return Err(DataLoaderError::ZeroBatchSize);
        }
        if datasets.is_empty() {
            return Err(DataLoaderError::NoDatasets);
        }
        let mut offsets = Vec::with_capacity(datasets.len());
        let mut len = 0;
        for dataset in datasets.iter() {
            offsets.push(len);
            len += dataset.len();
        }
        let workers = if num_workers > 0 {
            let pool = ThreadPoolBuilder::new()
                .num_threads(num_workers)
                .thread_name(|i| format!("loader-{i}"))
                .build()
                .map_err(|source| DataLoaderError::Workers {
                    num_workers,
                    source,
                })?;
            Some(pool)
        } else {
            None
        };
        Ok(Self {
            datasets,
            offsets,
            len,
            batch_size,
            shuffle: true,
            drop_last: false,
            workers,
        })
    }

    pub fn shuffle(mut self, shuffle: bool) -> Self {
        self.shuffle = shuffle;
        self
    }

    /// Skips the last batch when it is smaller than the batch size
    pub fn drop_last(mut self, drop_last: bool) -> Self {
        self.drop_last = drop_last;
        self
    }

    /// Total number of samples over all datasets
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn n_batches(&self) -> usize {
        if self.drop_last {
            self.len / self.batch_size
        } else {
            self.len.div_ceil(self.batch_size)
        }
    }

    /// Fetches a sample by its index in the concatenation of all datasets
    fn sample(&self, index: usize) -> Result<Sample, DatasetError> {
        let dataset_idx = self.offsets.partition_point(|&offset| offset <= index) - 1;
        self.datasets[dataset_idx].get(index - self.offsets[dataset_idx])
    }

    pub fn seeded_iter(&self, seed: u64) -> DataLoaderIterator<'_> {
        self.iter_with(&mut Pcg64Mcg::seed_from_u64(seed))
    }

    pub fn iter(&self) -> DataLoaderIterator<'_> {
        self.iter_with(&mut rand::rng())
    }

    fn iter_with(&self, rng: &mut impl Rng) -> DataLoaderIterator<'_> {
        let mut indices = (0..self.len).collect::<Vec<_>>();
        if self.shuffle {
            indices.shuffle(rng);
        }
        if self.drop_last {
            indices.truncate(self.n_batches() * self.batch_size);
        }
        DataLoaderIterator {
            loader: self,
            indices,
            curr_iter: 0,
        }
    }

    fn load_batch(&self, indices: &[usize]) -> Result<Batch, DataLoaderError> {
        let samples = match &self.workers {
            Some(pool) => pool.install(|| {
                indices
                    .par_iter()
                    .map(|&i| self.sample(i))
                    .collect::<Result<Vec<_>, _>>()
            })?,
            None => indices
                .iter()
                .map(|&i| self.sample(i))
                .collect::<Result<Vec<_>, _>>()?,
        };
        collate(samples)
    }
}

/// Stacks samples of the same shape into a `[B, C, H, W]` batch
fn collate(samples: Vec<Sample>) -> Result<Batch, DataLoaderError> {
    let shape = samples.first().map(|s| s.shape).unwrap_or_default();
    let mut data = Vec::with_capacity(samples.len() * shape.iter().product::<usize>());
    let mut target = Vec::with_capacity(samples.len());
    for sample in samples.iter() {
        if sample.shape != shape {
            return Err(DataLoaderError::SampleShapeMismatch {
                first: shape,
                other: sample.shape,
            });
        }
        data.extend_from_slice(&sample.data);
        target.push(sample.target);
    }
    let data = Tensor::new(
        data,
        vec![samples.len(), shape[0], shape[1], shape[2]],
    )?;
    Ok(Batch { data, target })
}

/// An iterator which returns mini batches until the end of the datasets
pub struct DataLoaderIterator<'a> {
    loader: &'a DataLoader,
    // optionally shuffled indices
    indices: Vec<usize>,
    curr_iter: usize,
}

impl Iterator for DataLoaderIterator<'_> {
    type Item = Result<Batch, DataLoaderError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.curr_iter >= self.indices.len() {
            return None;
        }
        let end = (self.curr_iter + self.loader.batch_size).min(self.indices.len());
        let batch = self.loader.load_batch(&self.indices[self.curr_iter..end]);
        self.curr_iter = end;
        Some(batch)
    }
}
