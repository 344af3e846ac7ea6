//! Checkpoints: model weights, optimizer state and trainer progress saved as JSON
//!
//! The trainer keeps two checkpoints, the state after the most recent epoch and the state
//! with the best validation loss so far.

use std::{
    fs::{self, File},
    io::{self, BufReader, BufWriter, Write},
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    file_structure::FileStructManager,
    nn::Module,
    optim::{OptimError, OptimizerState},
    tensor::TensorError,
};

pub const LAST_CHECKPOINT: &str = "last_checkpoint.json";
pub const BEST_CHECKPOINT: &str = "best_checkpoint.json";

/// Errors for saving and restoring checkpoints
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("Failed to access checkpoint '{path}'")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Malformed checkpoint '{path}'")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("Refusing to save checkpoint, '{name}' holds NaN or infinite values")]
    NonFinite { name: String },
    #[error("Checkpoint has no value for parameter '{name}'")]
    MissingParameter { name: String },
    #[error("Checkpoint has parameter '{name}' which the model does not")]
    UnexpectedParameter { name: String },
    #[error("Parameter '{name}' has shape {expected:?} but the checkpoint holds {got:?}")]
    ShapeMismatch {
        name: String,
        expected: Vec<usize>,
        got: Vec<usize>,
    },
    #[error(transparent)]
    Optim(#[from] OptimError),
    #[error(transparent)]
    Tensor(#[from] TensorError),
}

/// The values of one named model parameter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterState {
    pub name: String,
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

/// Progress of the training loop
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainerState {
    pub experiment_name: String,
    /// number of completed epochs
    pub epoch: usize,
    /// lowest loss of the stage used to pick the best state
    pub best_metric: Option<f32>,
    pub epochs_without_improvement: usize,
}

impl TrainerState {
    pub fn new(experiment_name: impl Into<String>) -> Self {
        Self {
            experiment_name: experiment_name.into(),
            epoch: 0,
            best_metric: None,
            epochs_without_improvement: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub trainer: TrainerState,
    pub optimizer: OptimizerState,
    pub weights: Vec<ParameterState>,
}

impl Checkpoint {
    /// Name of the first value JSON cannot represent
    fn find_non_finite(&self) -> Option<String> {
        if self.trainer.best_metric.is_some_and(|m| !m.is_finite()) {
            return Some("best_metric".to_string());
        }
        if !self.optimizer.lr.is_finite() {
            return Some("optimizer.lr".to_string());
        }
        if !self.optimizer.momentum.is_finite() {
            return Some("optimizer.momentum".to_string());
        }
        if let Some(i) = self
            .optimizer
            .buffers
            .iter()
            .position(|b| b.iter().any(|v| !v.is_finite()))
        {
            return Some(format!("optimizer.buffers[{i}]"));
        }
        self.weights
            .iter()
            .find(|w| w.data.iter().any(|v| !v.is_finite()))
            .map(|w| w.name.clone())
    }
}

/// Snapshots the parameters of `model`
pub fn model_state(model: &dyn Module) -> Vec<ParameterState> {
    model
        .named_parameters()
        .into_iter()
        .map(|(name, p)| ParameterState {
            name,
            shape: p.shape(),
            data: p.data().to_vec(),
        })
        .collect()
}

/// Overwrites the parameters of `model`, every parameter must be present with the same shape
pub fn load_model_state(
    model: &dyn Module,
    weights: &[ParameterState],
) -> Result<(), CheckpointError> {
    let parameters = model.named_parameters();
    if let Some(extra) = weights
        .iter()
        .find(|w| !parameters.iter().any(|(name, _)| *name == w.name))
    {
        return Err(CheckpointError::UnexpectedParameter {
            name: extra.name.clone(),
        });
    }
    for (name, mut param) in parameters {
        let state = weights
            .iter()
            .find(|w| w.name == name)
            .ok_or_else(|| CheckpointError::MissingParameter { name: name.clone() })?;
        if state.shape != param.shape() {
            return Err(CheckpointError::ShapeMismatch {
                name,
                expected: param.shape(),
                got: state.shape.clone(),
            });
        }
        param.set_data(state.data.clone())?;
    }
    Ok(())
}

/// Reads and writes the last and best checkpoints of a run
#[derive(Debug, Clone)]
pub struct CheckpointsManager {
    last: PathBuf,
    best: PathBuf,
}

impl CheckpointsManager {
    pub fn new(fsm: &FileStructManager) -> Self {
        Self {
            last: fsm.checkpoint_path(LAST_CHECKPOINT),
            best: fsm.checkpoint_path(BEST_CHECKPOINT),
        }
    }

    pub fn path(&self, best: bool) -> &Path {
        if best { &self.best } else { &self.last }
    }

    /// Saves `checkpoint` as the last one, and also as the best one if `is_best`
    /// Fails with [`CheckpointError::NonFinite`] before writing anything when a value is NaN or
    /// infinite, such a checkpoint could not be loaded again.
    pub fn save(&self, checkpoint: &Checkpoint, is_best: bool) -> Result<(), CheckpointError> {
        if let Some(name) = checkpoint.find_non_finite() {
            return Err(CheckpointError::NonFinite { name });
        }
        write_atomic(&self.last, checkpoint)?;
        if is_best {
            write_atomic(&self.best, checkpoint)?;
        }
        log::debug!(
            "Saved checkpoint of epoch {} to '{}'",
            checkpoint.trainer.epoch,
            self.last.display()
        );
        Ok(())
    }

    pub fn load(&self, best: bool) -> Result<Checkpoint, CheckpointError> {
        let path = self.path(best);
        let file = File::open(path).map_err(|source| CheckpointError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_reader(BufReader::new(file)).map_err(|source| CheckpointError::Json {
            path: path.to_path_buf(),
            source,
        })
    }
}

// a crash while writing must not corrupt the previous checkpoint
fn write_atomic(path: &Path, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
    let partial = path.with_extension("json.part");
    let io_err = |source| CheckpointError::Io {
        path: partial.clone(),
        source,
    };
    let mut writer = BufWriter::new(File::create(&partial).map_err(io_err)?);
    serde_json::to_writer(&mut writer, checkpoint).map_err(|source| CheckpointError::Json {
        path: partial.clone(),
        source,
    })?;
    writer.flush().map_err(io_err)?;
    drop(writer);
    fs::rename(&partial, path).map_err(|source| CheckpointError::Io {
        path: path.to_path_buf(),
        source,
    })
}
