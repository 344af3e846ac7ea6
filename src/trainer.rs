//! The training loop
//!
//! Every epoch runs the configured stages in order. Train stages update the model batch by
//! batch, validation stages only evaluate it. After each epoch the monitors are updated, the
//! last checkpoint is saved, and the best checkpoint is replaced when the tracked loss improved.

use indicatif::{ProgressBar, ProgressStyle};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    checkpoint::{
        Checkpoint, CheckpointError, CheckpointsManager, TrainerState, load_model_state,
        model_state,
    },
    dataloader::DataLoaderError,
    file_structure::{FileStructError, FileStructManager},
    loss::Loss,
    monitoring::{EpochRecord, Monitor, MonitorError},
    nn::{Module, NNError},
    optim::Optim,
    tensor::TensorError,
    train_config::{MetricsAccumulator, Stage, StageKind, StageMetrics, TrainConfig},
};

/// Errors for the training loop
#[derive(Debug, Error)]
pub enum TrainerError {
    #[error("The training config has no stages")]
    NoStages,
    #[error("Stage '{name}' has no data")]
    EmptyStage { name: String },
    #[error("Checkpoint belongs to experiment '{found}', expected '{expected}'")]
    ExperimentMismatch { expected: String, found: String },
    #[error(transparent)]
    FileStruct(#[from] FileStructError),
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
    #[error(transparent)]
    DataLoader(#[from] DataLoaderError),
    #[error(transparent)]
    NN(#[from] NNError),
    #[error(transparent)]
    Tensor(#[from] TensorError),
    #[error(transparent)]
    Monitor(#[from] MonitorError),
}

/// Multiplies the learning rate by `coeff` after `patience` epochs without improvement
#[derive(Debug, Clone, Copy)]
struct LrDecay {
    coeff: f32,
    patience: usize,
}

/// What happened in one epoch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochReport {
    /// 1-based
    pub epoch: usize,
    pub lr: f32,
    pub records: Vec<EpochRecord>,
    pub is_best: bool,
}

/// Runs the epochs of a [`TrainConfig`] on a model
pub struct Trainer<M: Module> {
    model: M,
    config: TrainConfig,
    fsm: FileStructManager,
    checkpoints: CheckpointsManager,
    epoch_num: usize,
    monitors: Vec<Box<dyn Monitor>>,
    lr_decay: Option<LrDecay>,
    // `Some(from_best)` when continuing a previous run
    resume_from: Option<bool>,
    seed: Option<u64>,
    show_progress: bool,
}

impl<M: Module> Trainer<M> {
    pub fn new(model: M, config: TrainConfig, fsm: FileStructManager) -> Self {
        let checkpoints = CheckpointsManager::new(&fsm);
        Self {
            model,
            config,
            fsm,
            checkpoints,
            epoch_num: 1,
            monitors: vec![],
            lr_decay: None,
            resume_from: None,
            seed: None,
            show_progress: true,
        }
    }

    /// Total number of epochs, including those of a resumed run
    pub fn set_epoch_num(mut self, epoch_num: usize) -> Self {
        self.epoch_num = epoch_num;
        self
    }

    /// A `patience` of 0 is treated as 1, an improving epoch never decays the learning rate
    pub fn enable_lr_decaying(mut self, coeff: f32, patience: usize) -> Self {
        self.lr_decay = Some(LrDecay {
            coeff,
            patience: patience.max(1),
        });
        self
    }

    /// Continues from the last checkpoint, or the best one if `from_best`
    pub fn resume(mut self, from_best: bool) -> Self {
        self.resume_from = Some(from_best);
        self
    }

    pub fn add_monitor(mut self, monitor: impl Monitor + 'static) -> Self {
        self.monitors.push(Box::new(monitor));
        self
    }

    /// Makes the shuffling of every epoch reproducible
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn show_progress(mut self, show_progress: bool) -> Self {
        self.show_progress = show_progress;
        self
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn into_model(self) -> M {
        self.model
    }

    pub fn config(&self) -> &TrainConfig {
        &self.config
    }

    pub fn train(&mut self) -> Result<Vec<EpochReport>, TrainerError> {
        if self.config.stages.is_empty() {
            return Err(TrainerError::NoStages);
        }
        if let Some(stage) = self.config.stages.iter().find(|s| s.data().is_empty()) {
            return Err(TrainerError::EmptyStage {
                name: stage.name().to_string(),
            });
        }
        self.fsm.prepare(self.resume_from.is_some())?;

        let mut state = match self.resume_from {
            Some(from_best) => self.restore(from_best)?,
            None => TrainerState::new(self.config.experiment_name()),
        };
        if self.resume_from.is_some() {
            for monitor in self.monitors.iter_mut() {
                monitor.resume(state.epoch)?;
            }
        }
        log::info!(
            "Training '{}' from epoch {} to {}, checkpoints in '{}', logs in '{}'",
            state.experiment_name,
            state.epoch + 1,
            self.epoch_num,
            self.fsm.checkpoint_dir().display(),
            self.fsm.logdir().display()
        );

        let mut reports = Vec::with_capacity(self.epoch_num.saturating_sub(state.epoch));
        for epoch in state.epoch..self.epoch_num {
            let report = self.run_epoch(epoch, &mut state)?;
            reports.push(report);
        }
        Ok(reports)
    }

    fn run_epoch(
        &mut self,
        epoch: usize,
        state: &mut TrainerState,
    ) -> Result<EpochReport, TrainerError> {
        let lr = self.config.optimizer.lr();
        let mut records = Vec::with_capacity(self.config.stages.len());
        let TrainConfig {
            stages,
            loss,
            optimizer,
            ..
        } = &mut self.config;
        for stage in stages.iter_mut() {
            let progress = progress_bar(self.show_progress, epoch, stage);
            let seed = self.seed.map(|s| s.wrapping_add(epoch as u64));
            let metrics = run_stage(
                &self.model,
                stage,
                loss.as_ref(),
                optimizer.as_mut(),
                seed,
                &progress,
            )?;
            progress.finish_and_clear();
            stage.set_metrics(metrics.clone());
            records.push(EpochRecord {
                epoch: epoch + 1,
                stage: stage.name().to_string(),
                kind: stage.kind(),
                lr,
                metrics,
            });
        }

        // the last validation stage decides, the last stage otherwise
        let tracked = records
            .iter()
            .rev()
            .find(|r| r.kind == StageKind::Validation)
            .or(records.last())
            .map(|r| r.metrics.loss_mean)
            .unwrap_or(f32::INFINITY);
        let is_best =
            tracked.is_finite() && state.best_metric.is_none_or(|best| tracked < best);
        if is_best {
            state.best_metric = Some(tracked);
            state.epochs_without_improvement = 0;
        } else {
            state.epochs_without_improvement += 1;
        }
        state.epoch = epoch + 1;

        for monitor in self.monitors.iter_mut() {
            monitor.update(&records)?;
        }

        if let Some(decay) = self.lr_decay {
            if state.epochs_without_improvement >= decay.patience {
                let new_lr = self.config.optimizer.lr() * decay.coeff;
                log::info!(
                    "No improvement for {} epochs, decaying learning rate to {}",
                    state.epochs_without_improvement,
                    new_lr
                );
                self.config.optimizer.set_lr(new_lr);
                state.epochs_without_improvement = 0;
            }
        }

        let checkpoint = Checkpoint {
            trainer: state.clone(),
            optimizer: self.config.optimizer.state(),
            weights: model_state(&self.model),
        };
        self.checkpoints.save(&checkpoint, is_best)?;
        if is_best {
            log::info!("Epoch {} improved the best loss to {:.5}", epoch + 1, tracked);
        }

        Ok(EpochReport {
            epoch: epoch + 1,
            lr,
            records,
            is_best,
        })
    }

    fn restore(&mut self, from_best: bool) -> Result<TrainerState, TrainerError> {
        let checkpoint = self.checkpoints.load(from_best)?;
        if checkpoint.trainer.experiment_name != self.config.experiment_name() {
            return Err(TrainerError::ExperimentMismatch {
                expected: self.config.experiment_name().to_string(),
                found: checkpoint.trainer.experiment_name,
            });
        }
        load_model_state(&self.model, &checkpoint.weights)?;
        self.config
            .optimizer
            .load_state(checkpoint.optimizer)
            .map_err(CheckpointError::from)?;
        log::info!(
            "Resumed from '{}' after epoch {}",
            self.checkpoints.path(from_best).display(),
            checkpoint.trainer.epoch
        );
        Ok(checkpoint.trainer)
    }
}

fn progress_bar(show: bool, epoch: usize, stage: &Stage) -> ProgressBar {
    if !show {
        return ProgressBar::hidden();
    }
    let progress = ProgressBar::new(stage.data().n_batches() as u64);
    let style = ProgressStyle::with_template("{prefix} [{bar:40}] {pos}/{len} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=> ");
    progress.set_style(style);
    progress.set_prefix(format!("epoch {} {}", epoch + 1, stage.name()));
    progress
}

/// One pass over the data of `stage`
fn run_stage(
    model: &dyn Module,
    stage: &Stage,
    loss_fn: &dyn Loss,
    optimizer: &mut dyn Optim,
    seed: Option<u64>,
    progress: &ProgressBar,
) -> Result<StageMetrics, TrainerError> {
    let is_train = stage.kind() == StageKind::Train;
    let batches = match seed {
        Some(seed) => stage.data().seeded_iter(seed),
        None => stage.data().iter(),
    };
    let mut metrics = MetricsAccumulator::default();
    for batch in batches {
        let batch = batch?;
        if is_train {
            optimizer.zero_grad();
        }
        let output = model.forward(&batch.data)?;
        let loss = loss_fn.call(&output, &batch.target)?;
        if is_train {
            loss.backward()?;
            optimizer.step();
        }
        let loss = loss.item()?;
        metrics.add_batch(loss, &output.argmax_rows()?, &batch.target);
        progress.set_message(format!("loss: {loss:.4}"));
        progress.inc(1);
    }
    Ok(metrics.finish())
}

#[cfg(test)]
mod tests {
    use std::{fs, sync::Arc};

    use rand::SeedableRng;
    use rand_pcg::Pcg64Mcg;
    use tempfile::TempDir;

    use crate::{
        assert_eq_float,
        checkpoint::LAST_CHECKPOINT,
        dataloader::DataLoader,
        datasets::{Dataset, tests::synthetic_mnist},
        loss::NLLLoss,
        monitoring::{LOSS_PLOT, LogMonitor, LossPlotMonitor, METRICS_LOG},
        nn::{Linear, LogSoftmax, prefixed},
        optim::SGD,
        tensor::Tensor,
    };

    use super::*;

    /// Logistic regression on the flattened image, much faster than the CNN
    struct LogisticRegression {
        fc: Linear,
        log_softmax: LogSoftmax,
    }

    impl LogisticRegression {
        fn new(seed: u64) -> Self {
            Self {
                fc: Linear::new(28 * 28, 10, &mut Pcg64Mcg::seed_from_u64(seed)),
                log_softmax: LogSoftmax::new(),
            }
        }
    }

    impl Module for LogisticRegression {
        fn forward(&self, input: &Tensor) -> Result<Tensor, NNError> {
            let batch = input.shape()[0];
            let x = input.reshape(vec![batch, 28 * 28])?;
            self.log_softmax.forward(&self.fc.forward(&x)?)
        }

        fn named_parameters(&self) -> Vec<(String, Tensor)> {
            prefixed("fc", &self.fc)
        }
    }

    fn trainer(temp: &TempDir, seed: u64, lr: f32) -> Trainer<LogisticRegression> {
        let dataset: Arc<dyn Dataset> = Arc::new(synthetic_mnist(20));
        let train = DataLoader::new(vec![dataset.clone()], 4, 0).unwrap();
        let validation = DataLoader::new(vec![dataset], 8, 0)
            .unwrap()
            .shuffle(false);
        let model = LogisticRegression::new(seed);
        let optimizer = SGD::new(model.parameters(), lr, 0.5);
        let config = TrainConfig::new(
            vec![Stage::train(train), Stage::validation(validation)],
            NLLLoss,
            optimizer,
            "logistic",
        );
        let fsm = FileStructManager::new(
            temp.path().join("checkpoints"),
            temp.path().join("logs"),
            None,
        );
        Trainer::new(model, config, fsm.clone())
            .add_monitor(LogMonitor::new(&fsm))
            .with_seed(seed)
            .show_progress(false)
    }

    #[test]
    fn test_train_writes_checkpoints_and_logs() {
        let temp = TempDir::new().unwrap();
        let fsm = FileStructManager::new(
            temp.path().join("checkpoints"),
            temp.path().join("logs"),
            None,
        );
        let mut trainer = trainer(&temp, 0, 1.0e-3)
            .set_epoch_num(3)
            .add_monitor(LossPlotMonitor::new(&fsm));
        let reports = trainer.train().unwrap();

        assert_eq!(reports.len(), 3);
        assert!(reports[0].is_best);
        for (i, report) in reports.iter().enumerate() {
            assert_eq!(report.epoch, i + 1);
            assert_eq!(report.records.len(), 2);
            assert_eq!(report.records[0].metrics.n_samples, 20);
            assert_eq!(report.records[1].kind, StageKind::Validation);
        }
        // the stages keep the metrics of the last epoch
        let stages = trainer.config().stages();
        assert_eq!(stages[1].metrics(), Some(&reports[2].records[1].metrics));

        let checkpoints = temp.path().join("checkpoints");
        assert!(checkpoints.join(LAST_CHECKPOINT).is_file());
        assert!(checkpoints.join("best_checkpoint.json").is_file());
        let log = fs::read_to_string(temp.path().join("logs").join(METRICS_LOG)).unwrap();
        assert_eq!(log.lines().count(), 6);
        assert!(temp.path().join("logs").join(LOSS_PLOT).is_file());
    }

    #[test]
    fn test_training_reduces_loss() {
        let temp = TempDir::new().unwrap();
        let mut trainer = trainer(&temp, 1, 1.0e-3).set_epoch_num(15);
        let reports = trainer.train().unwrap();
        let first = reports[0].records[1].metrics.loss_mean;
        let last = reports[reports.len() - 1].records[1].metrics.loss_mean;
        assert!(last < first, "{last} >= {first}");
    }

    #[test]
    fn test_fresh_run_refuses_existing_checkpoints() {
        let temp = TempDir::new().unwrap();
        trainer(&temp, 0, 1.0e-3).train().unwrap();
        let err = trainer(&temp, 0, 1.0e-3).train().unwrap_err();
        assert!(matches!(
            err,
            TrainerError::FileStruct(FileStructError::CheckpointsExist { .. })
        ));
    }

    #[test]
    fn test_resume() {
        let temp = TempDir::new().unwrap();
        let mut first = trainer(&temp, 0, 1.0e-3).set_epoch_num(2);
        first.train().unwrap();
        let trained = model_state(first.model());

        // a differently initialized model picks up the weights and the epoch count
        let mut resumed = trainer(&temp, 5, 1.0e-3).set_epoch_num(3).resume(false);
        let checkpoint = CheckpointsManager::new(&resumed.fsm).load(false).unwrap();
        assert_eq!(checkpoint.trainer.epoch, 2);
        assert_eq!(checkpoint.weights, trained);

        let reports = resumed.train().unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].epoch, 3);

        // nothing left to do
        let mut done = trainer(&temp, 5, 1.0e-3).set_epoch_num(3).resume(false);
        assert!(done.train().unwrap().is_empty());
    }

    // without a train stage the loss never changes, so only the first epoch improves
    fn validation_only(temp: &TempDir) -> Trainer<LogisticRegression> {
        let dataset: Arc<dyn Dataset> = Arc::new(synthetic_mnist(20));
        let validation = DataLoader::new(vec![dataset], 8, 0)
            .unwrap()
            .shuffle(false);
        let model = LogisticRegression::new(0);
        let optimizer = SGD::new(model.parameters(), 0.1, 0.5);
        let config = TrainConfig::new(
            vec![Stage::validation(validation)],
            NLLLoss,
            optimizer,
            "decay",
        );
        let fsm = FileStructManager::new(temp.path(), temp.path(), None);
        Trainer::new(model, config, fsm)
            .set_epoch_num(4)
            .show_progress(false)
    }

    #[test]
    fn test_lr_decay() {
        let temp = TempDir::new().unwrap();
        let mut trainer = validation_only(&temp).enable_lr_decaying(0.5, 1);
        let reports = trainer.train().unwrap();

        let lrs = reports.iter().map(|r| r.lr).collect::<Vec<_>>();
        assert_eq!(lrs, vec![0.1, 0.1, 0.05, 0.025]);
        assert!(reports[0].is_best);
        assert!(reports[1..].iter().all(|r| !r.is_best));
        assert_eq_float!(trainer.config().optimizer().lr(), 0.0125);
    }

    #[test]
    fn test_lr_decay_zero_patience() {
        let temp = TempDir::new().unwrap();
        let mut trainer = validation_only(&temp).enable_lr_decaying(0.5, 0);
        let reports = trainer.train().unwrap();

        // the improving first epoch keeps its learning rate
        let lrs = reports.iter().map(|r| r.lr).collect::<Vec<_>>();
        assert_eq!(lrs, vec![0.1, 0.1, 0.05, 0.025]);
    }

    #[test]
    fn test_empty_config() {
        let temp = TempDir::new().unwrap();
        let model = LogisticRegression::new(0);
        let optimizer = SGD::new(model.parameters(), 0.1, 0.0);
        let config = TrainConfig::new(vec![], NLLLoss, optimizer, "empty");
        let fsm = FileStructManager::new(temp.path(), temp.path(), None);
        let err = Trainer::new(model, config, fsm).train().unwrap_err();
        assert!(matches!(err, TrainerError::NoStages));
    }
}
