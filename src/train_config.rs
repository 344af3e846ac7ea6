//! Training configuration: the stages run every epoch, the loss and the optimizer

use std::fmt::{self, Display};

use serde::{Deserialize, Deserializer, Serialize};

use crate::{dataloader::DataLoader, loss::Loss, optim::Optim};

/// Whether a stage updates the model or only evaluates it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Train,
    Validation,
}

impl Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageKind::Train => write!(f, "train"),
            StageKind::Validation => write!(f, "validation"),
        }
    }
}

/// Aggregated metrics of one run over a stage's data. A diverged run has NaN losses, which
/// serialize to `null` and are read back as NaN.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageMetrics {
    #[serde(deserialize_with = "nan_if_null")]
    pub loss_mean: f32,
    #[serde(deserialize_with = "nan_if_null")]
    pub loss_min: f32,
    #[serde(deserialize_with = "nan_if_null")]
    pub loss_max: f32,
    /// fraction of samples whose most likely class is the target
    #[serde(deserialize_with = "nan_if_null")]
    pub accuracy: f32,
    pub n_samples: usize,
}

fn nan_if_null<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f32, D::Error> {
    Ok(Option::<f32>::deserialize(deserializer)?.unwrap_or(f32::NAN))
}

/// Collects the per batch losses and predictions of a stage run
#[derive(Debug, Default)]
pub struct MetricsAccumulator {
    losses: Vec<f32>,
    n_correct: usize,
    n_samples: usize,
}

impl MetricsAccumulator {
    pub fn add_batch(&mut self, loss: f32, predictions: &[usize], targets: &[usize]) {
        self.losses.push(loss);
        self.n_correct += predictions
            .iter()
            .zip(targets)
            .filter(|(p, t)| p == t)
            .count();
        self.n_samples += targets.len();
    }

    pub fn finish(self) -> StageMetrics {
        if self.losses.is_empty() {
            return StageMetrics::default();
        }
        let n_batches = self.losses.len() as f32;
        StageMetrics {
            loss_mean: self.losses.iter().sum::<f32>() / n_batches,
            loss_min: self.losses.iter().copied().fold(f32::INFINITY, f32::min),
            loss_max: self.losses.iter().copied().fold(f32::NEG_INFINITY, f32::max),
            accuracy: self.n_correct as f32 / self.n_samples.max(1) as f32,
            n_samples: self.n_samples,
        }
    }
}

/// A pass over one data loader, run once per epoch
pub struct Stage {
    name: String,
    kind: StageKind,
    data: DataLoader,
    last_metrics: Option<StageMetrics>,
}

impl Stage {
    /// A stage whose batches update the model
    pub fn train(data: DataLoader) -> Self {
        Self::new(StageKind::Train, data)
    }

    /// A stage which only evaluates the model
    pub fn validation(data: DataLoader) -> Self {
        Self::new(StageKind::Validation, data)
    }

    fn new(kind: StageKind, data: DataLoader) -> Self {
        Self {
            name: kind.to_string(),
            kind,
            data,
            last_metrics: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> StageKind {
        self.kind
    }

    pub fn data(&self) -> &DataLoader {
        &self.data
    }

    /// Metrics of the most recent run, `None` before the first epoch
    pub fn metrics(&self) -> Option<&StageMetrics> {
        self.last_metrics.as_ref()
    }

    pub(crate) fn set_metrics(&mut self, metrics: StageMetrics) {
        self.last_metrics = Some(metrics);
    }
}

/// Everything the trainer needs besides the model
pub struct TrainConfig {
    pub(crate) stages: Vec<Stage>,
    pub(crate) loss: Box<dyn Loss>,
    pub(crate) optimizer: Box<dyn Optim>,
    experiment_name: String,
}

impl TrainConfig {
    pub fn new(
        stages: Vec<Stage>,
        loss: impl Loss + 'static,
        optimizer: impl Optim + 'static,
        experiment_name: impl Into<String>,
    ) -> Self {
        Self {
            stages,
            loss: Box::new(loss),
            optimizer: Box::new(optimizer),
            experiment_name: experiment_name.into(),
        }
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn optimizer(&self) -> &dyn Optim {
        self.optimizer.as_ref()
    }

    pub fn experiment_name(&self) -> &str {
        &self.experiment_name
    }
}
