//! Output directories of a training run

use std::{
    fs, io,
    path::{Path, PathBuf},
};

use thiserror::Error;

/// Errors for preparing the output directories
#[derive(Debug, Error)]
pub enum FileStructError {
    #[error(
        "Checkpoint directory '{path}' already holds checkpoints, resume the run or choose another directory"
    )]
    CheckpointsExist { path: PathBuf },
    #[error("Failed to prepare '{path}'")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Owns the checkpoint and log directories. With a prefix every file name becomes
/// `<prefix>_<name>`, so several runs can share the directories.
#[derive(Debug, Clone)]
pub struct FileStructManager {
    checkpoint_dir: PathBuf,
    logdir: PathBuf,
    prefix: Option<String>,
}

impl FileStructManager {
    pub fn new(
        checkpoint_dir: impl Into<PathBuf>,
        logdir: impl Into<PathBuf>,
        prefix: Option<String>,
    ) -> Self {
        Self {
            checkpoint_dir: checkpoint_dir.into(),
            logdir: logdir.into(),
            prefix,
        }
    }

    pub fn checkpoint_dir(&self) -> &Path {
        &self.checkpoint_dir
    }

    pub fn logdir(&self) -> &Path {
        &self.logdir
    }

    pub fn prefix(&self) -> Option<&str> {
        self.prefix.as_deref()
    }

    pub fn file_name(&self, name: &str) -> String {
        match &self.prefix {
            Some(prefix) => format!("{prefix}_{name}"),
            None => name.to_string(),
        }
    }

    pub fn checkpoint_path(&self, name: &str) -> PathBuf {
        self.checkpoint_dir.join(self.file_name(name))
    }

    pub fn log_path(&self, name: &str) -> PathBuf {
        self.logdir.join(self.file_name(name))
    }

    /// Creates both directories. A fresh run (`is_continue == false`) must not overwrite
    /// checkpoints of another run with the same prefix.
    pub fn prepare(&self, is_continue: bool) -> Result<(), FileStructError> {
        if !is_continue && self.has_checkpoints()? {
            return Err(FileStructError::CheckpointsExist {
                path: self.checkpoint_dir.clone(),
            });
        }
        for dir in [&self.checkpoint_dir, &self.logdir] {
            fs::create_dir_all(dir).map_err(|source| FileStructError::Io {
                path: dir.clone(),
                source,
            })?;
        }
        Ok(())
    }

    fn has_checkpoints(&self) -> Result<bool, FileStructError> {
        let entries = match fs::read_dir(&self.checkpoint_dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(source) => {
                return Err(FileStructError::Io {
                    path: self.checkpoint_dir.clone(),
                    source,
                });
            }
        };
        let own_prefix = self.prefix.as_ref().map(|p| format!("{p}_"));
        for entry in entries {
            let entry = entry.map_err(|source| FileStructError::Io {
                path: self.checkpoint_dir.clone(),
                source,
            })?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let ours = own_prefix
                .as_deref()
                .is_none_or(|prefix| name.starts_with(prefix));
            if ours {
                return Ok(true);
            }
        }
        Ok(false)
    }
}
