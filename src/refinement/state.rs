//! Persisted refinement state.
//!
//! After each evaluation the root worker may write the functional history
//! and the full parameter vector to `<dir>/trial<T>_state.json`. A later run
//! restarts from that file through `RefinerOptions::restart_file`.
use crate::refinement::errors::{RefineError, RefineResult};
use ndarray::Array1;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefinerState {
    pub trial: usize,
    pub iteration: usize,
    pub f_vals: Vec<f64>,
    pub xall: Array1<f64>,
}

impl RefinerState {
    /// # Errors
    /// [`RefineError::StateIo`] when the file cannot be read or parsed.
    pub fn load(path: &Path) -> RefineResult<Self> {
        let text = fs::read_to_string(path).map_err(|e| io_error(path, e))?;
        serde_json::from_str(&text).map_err(|e| io_error(path, e))
    }
}

fn io_error(path: &Path, err: impl std::fmt::Display) -> RefineError {
    RefineError::StateIo { path: path.display().to_string(), text: err.to_string() }
}

/// Where one trial's state is written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateArchive {
    dir: PathBuf,
    trial: usize,
}

impl StateArchive {
    pub fn new(dir: impl Into<PathBuf>, trial: usize) -> Self {
        Self { dir: dir.into(), trial }
    }

    pub fn path(&self) -> PathBuf {
        self.dir.join(format!("trial{}_state.json", self.trial))
    }

    /// Overwrite the archive with `state`, creating the directory if needed.
    ///
    /// # Errors
    /// [`RefineError::StateIo`] on any filesystem or encoding failure.
    pub fn save(&self, state: &RefinerState) -> RefineResult<()> {
        fs::create_dir_all(&self.dir).map_err(|e| io_error(&self.dir, e))?;
        let path = self.path();
        let text = serde_json::to_string(state).map_err(|e| io_error(&path, e))?;
        fs::write(&path, text).map_err(|e| io_error(&path, e))
    }

    pub fn load(&self) -> RefineResult<RefinerState> {
        RefinerState::load(&self.path())
    }
}
