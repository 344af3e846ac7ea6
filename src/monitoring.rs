//! Monitors which report the metrics of every epoch

use std::{
    collections::BTreeMap,
    error::Error,
    fs::{self, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
};

use plotters::{
    chart::{ChartBuilder, SeriesLabelPosition},
    element::PathElement,
    prelude::{BitMapBackend, IntoDrawingArea},
    series::LineSeries,
    style::{BLACK, Color, Palette, Palette99, WHITE},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    file_structure::FileStructManager,
    train_config::{StageKind, StageMetrics},
};

pub const METRICS_LOG: &str = "metrics.jsonl";
pub const LOSS_PLOT: &str = "losses.png";

/// Errors for the monitors
#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("Failed to write '{path}'")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("Failed to plot '{path}': {message}")]
    Plot { path: PathBuf, message: String },
}

/// Metrics of one stage in one epoch, one line of the metrics log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochRecord {
    /// 1-based
    pub epoch: usize,
    pub stage: String,
    pub kind: StageKind,
    /// learning rate used during the epoch
    pub lr: f32,
    #[serde(flatten)]
    pub metrics: StageMetrics,
}

/// Receives the records of all stages once per epoch
pub trait Monitor {
    fn update(&mut self, records: &[EpochRecord]) -> Result<(), MonitorError>;

    /// Called once before training continues after `epoch` completed epochs
    fn resume(&mut self, _epoch: usize) -> Result<(), MonitorError> {
        Ok(())
    }
}

/// Reads the records of the metrics log, an absent log has none
pub fn read_metrics_log(path: &Path) -> Result<Vec<EpochRecord>, MonitorError> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(vec![]),
        Err(source) => {
            return Err(MonitorError::Io {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| serde_json::from_str::<EpochRecord>(line).map_err(MonitorError::from))
        .collect()
}

/// Logs a summary and appends every record as a JSON line to `<logdir>/<prefix>_metrics.jsonl`
pub struct LogMonitor {
    path: PathBuf,
}

impl LogMonitor {
    pub fn new(fsm: &FileStructManager) -> Self {
        Self {
            path: fsm.log_path(METRICS_LOG),
        }
    }
}

impl Monitor for LogMonitor {
    fn update(&mut self, records: &[EpochRecord]) -> Result<(), MonitorError> {
        let io_err = |source| MonitorError::Io {
            path: self.path.clone(),
            source,
        };
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(io_err)?;
        for record in records {
            log::info!(
                "epoch: {}, stage: {}, loss: {:.5} (min {:.5}, max {:.5}), accuracy: {:.4}, lr: {}",
                record.epoch,
                record.stage,
                record.metrics.loss_mean,
                record.metrics.loss_min,
                record.metrics.loss_max,
                record.metrics.accuracy,
                record.lr
            );
            let mut line = serde_json::to_string(record)?;
            line.push('\n');
            file.write_all(line.as_bytes()).map_err(io_err)?;
        }
        Ok(())
    }

    /// Drops the records of epochs after `epoch`, e.g. when continuing from the best checkpoint
    fn resume(&mut self, epoch: usize) -> Result<(), MonitorError> {
        let records = read_metrics_log(&self.path)?;
        if records.iter().all(|r| r.epoch <= epoch) {
            return Ok(());
        }
        let mut content = String::new();
        for record in records.iter().filter(|r| r.epoch <= epoch) {
            content.push_str(&serde_json::to_string(record)?);
            content.push('\n');
        }
        fs::write(&self.path, content).map_err(|source| MonitorError::Io {
            path: self.path.clone(),
            source,
        })
    }
}

/// Plots the mean loss of every stage against the epoch to `<logdir>/<prefix>_losses.png`.
/// On resume the earlier epochs are read back from the metrics log.
pub struct LossPlotMonitor {
    path: PathBuf,
    metrics_log: PathBuf,
    // stage name -> (epoch, mean loss)
    history: BTreeMap<String, Vec<(usize, f32)>>,
}

impl LossPlotMonitor {
    pub fn new(fsm: &FileStructManager) -> Self {
        Self {
            path: fsm.log_path(LOSS_PLOT),
            metrics_log: fsm.log_path(METRICS_LOG),
            history: BTreeMap::new(),
        }
    }

    fn record(&mut self, record: &EpochRecord) {
        self.history
            .entry(record.stage.clone())
            .or_default()
            .push((record.epoch, record.metrics.loss_mean));
    }

    fn plot(&self) -> Result<(), Box<dyn Error>> {
        let points = || self.history.values().flatten().filter(|(_, loss)| loss.is_finite());
        let last_epoch = points().map(|(epoch, _)| *epoch).max().unwrap_or(1);
        let (mut y_min, mut y_max) = points()
            .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), p| {
                (lo.min(p.1), hi.max(p.1))
            });
        if !y_min.is_finite() || !y_max.is_finite() {
            (y_min, y_max) = (0.0, 1.0);
        }
        let margin = ((y_max - y_min) * 0.05).max(0.01);

        let root_area = BitMapBackend::new(&self.path, (640, 480)).into_drawing_area();
        root_area.fill(&WHITE)?;

        let mut chart = ChartBuilder::on(&root_area)
            .margin(20)
            .x_label_area_size(30)
            .y_label_area_size(50)
            .build_cartesian_2d(1usize..last_epoch.max(2), (y_min - margin)..(y_max + margin))?;

        for (i, (stage, points)) in self.history.iter().enumerate() {
            let color = Palette99::pick(i).to_rgba();
            let finite = points.iter().copied().filter(|(_, loss)| loss.is_finite());
            chart
                .draw_series(LineSeries::new(finite, color.stroke_width(2)))?
                .label(stage.as_str())
                .legend(move |(x, y)| {
                    PathElement::new(vec![(x, y), (x + 20, y)], color.stroke_width(2))
                });
        }

        // text needs a system font, headless machines may have none
        let labels = (|| -> Result<(), Box<dyn Error>> {
            chart
                .configure_mesh()
                .x_desc("epoch")
                .y_desc("mean loss")
                .draw()?;
            chart
                .configure_series_labels()
                .position(SeriesLabelPosition::UpperRight)
                .background_style(WHITE.mix(0.8))
                .border_style(&BLACK)
                .draw()?;
            Ok(())
        })();
        if let Err(e) = labels {
            log::warn!("Loss plot drawn without axes and legend: {}", e);
        }

        root_area.present()?;
        Ok(())
    }
}

impl Monitor for LossPlotMonitor {
    fn update(&mut self, records: &[EpochRecord]) -> Result<(), MonitorError> {
        for record in records {
            self.record(record);
        }
        self.plot().map_err(|e| MonitorError::Plot {
            path: self.path.clone(),
            message: e.to_string(),
        })?;
        log::debug!("Loss plot saved to '{}'", self.path.display());
        Ok(())
    }

    fn resume(&mut self, epoch: usize) -> Result<(), MonitorError> {
        self.history.clear();
        for record in read_metrics_log(&self.metrics_log)?
            .iter()
            .filter(|r| r.epoch <= epoch)
        {
            self.record(record);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::TempDir;

    use super::*;

    fn record(epoch: usize, stage: &str, loss: f32) -> EpochRecord {
        EpochRecord {
            epoch,
            stage: stage.to_string(),
            kind: StageKind::Train,
            lr: 0.1,
            metrics: StageMetrics {
                loss_mean: loss,
                loss_min: loss,
                loss_max: loss,
                accuracy: 0.5,
                n_samples: 8,
            },
        }
    }

    #[test]
    fn test_log_monitor_appends_json_lines() {
        let temp = TempDir::new().unwrap();
        let fsm = FileStructManager::new(temp.path(), temp.path(), Some("run".to_string()));
        let mut monitor = LogMonitor::new(&fsm);
        monitor
            .update(&[record(1, "train", 2.0), record(1, "validation", 1.5)])
            .unwrap();
        monitor.update(&[record(2, "train", 1.0)]).unwrap();

        let content = fs::read_to_string(temp.path().join("run_metrics.jsonl")).unwrap();
        let records: Vec<EpochRecord> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(records.len(), 3);
        assert_eq!(records[2], record(2, "train", 1.0));

        // metrics are flattened into the record
        let value: serde_json::Value = serde_json::from_str(content.lines().next().unwrap()).unwrap();
        assert_eq!(value["loss_mean"], 2.0);
        assert_eq!(value["kind"], "train");
    }

    #[test]
    fn test_log_monitor_keeps_non_finite_losses() {
        let temp = TempDir::new().unwrap();
        let fsm = FileStructManager::new(temp.path(), temp.path(), None);
        LogMonitor::new(&fsm)
            .update(&[record(1, "train", f32::NAN)])
            .unwrap();
        let records = read_metrics_log(&fsm.log_path(METRICS_LOG)).unwrap();
        assert_eq!(records.len(), 1);
        assert!(records[0].metrics.loss_mean.is_nan());
    }

    #[test]
    fn test_loss_plot_written() {
        let temp = TempDir::new().unwrap();
        let fsm = FileStructManager::new(temp.path(), temp.path(), None);
        let mut monitor = LossPlotMonitor::new(&fsm);
        monitor
            .update(&[record(1, "train", 2.0), record(1, "validation", 2.5)])
            .unwrap();
        monitor
            .update(&[record(2, "train", 1.0), record(2, "validation", f32::NAN)])
            .unwrap();

        let size = fs::metadata(temp.path().join(LOSS_PLOT)).unwrap().len();
        assert!(size > 0);
        assert_eq!(monitor.history["train"], vec![(1, 2.0), (2, 1.0)]);
    }

    #[test]
    fn test_resume_reads_metrics_log() {
        let temp = TempDir::new().unwrap();
        let fsm = FileStructManager::new(temp.path(), temp.path(), None);
        let mut log = LogMonitor::new(&fsm);
        for epoch in 1..=3 {
            log.update(&[
                record(epoch, "train", 4.0 - epoch as f32),
                record(epoch, "validation", 5.0 - epoch as f32),
            ])
            .unwrap();
        }

        let mut plot = LossPlotMonitor::new(&fsm);
        plot.resume(2).unwrap();
        assert_eq!(plot.history["train"], vec![(1, 3.0), (2, 2.0)]);
        assert_eq!(plot.history["validation"], vec![(1, 4.0), (2, 3.0)]);

        // continuing from epoch 2 forgets the records of epoch 3
        log.resume(2).unwrap();
        let records = read_metrics_log(&fsm.log_path(METRICS_LOG)).unwrap();
        assert_eq!(records.len(), 4);
        assert!(records.iter().all(|r| r.epoch <= 2));
    }

    #[test]
    fn test_resume_without_log() {
        let temp = TempDir::new().unwrap();
        let fsm = FileStructManager::new(temp.path(), temp.path(), None);
        let mut plot = LossPlotMonitor::new(&fsm);
        plot.resume(5).unwrap();
        assert!(plot.history.is_empty());
    }
}
