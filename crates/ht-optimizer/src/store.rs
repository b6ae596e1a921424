//! Durable study output: trial history, best parameters and the final report.
//!
//! Files live in one output directory:
//!
//! - `trials_history.json`: every terminal trial, overwritten after each trial
//! - `best_params.yaml` (or `.json`): the best record, overwritten on improvement
//! - `optimization_results.json`: run summary, outcome counts and parameter
//!   importance, written when the study ends
//!
//! All writes go through [`write_atomic_with_retry`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use ht_types::{write_atomic_with_retry, ConfigFormat, PersistenceError};

use crate::search::Params;
use crate::trial::TrialRecord;

pub const HISTORY_FILE: &str = "trials_history.json";
pub const BEST_PARAMS_STEM: &str = "best_params";
pub const RESULTS_FILE: &str = "optimization_results.json";

/// The best-parameters document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BestRecord {
    pub best_score: f64,
    pub best_parameters: Params,
    pub timestamp: DateTime<Utc>,
    /// Trials finished when this record was written.
    pub total_trials: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub total_trials: usize,
    pub best_score: Option<f64>,
    pub best_params: Option<Params>,
    pub elapsed_seconds: f64,
    pub timestamp: DateTime<Utc>,
    pub cancelled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RunStatistics {
    pub completed_trials: usize,
    pub pruned_trials: usize,
    pub failed_trials: usize,
}

/// Final report written once a study stops.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationResults {
    #[serde(rename = "optimization_summary")]
    pub summary: RunSummary,
    #[serde(rename = "study_statistics")]
    pub statistics: RunStatistics,
    /// Normalized importance per parameter; empty with fewer than two
    /// Complete trials.
    #[serde(default)]
    pub parameter_importance: BTreeMap<String, f64>,
}

/// Writes study output under one directory.
#[derive(Debug, Clone)]
pub struct ResultStore {
    dir: PathBuf,
    best_format: ConfigFormat,
}

impl ResultStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            best_format: ConfigFormat::default(),
        }
    }

    pub fn with_best_format(mut self, format: ConfigFormat) -> Self {
        self.best_format = format;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn history_path(&self) -> PathBuf {
        self.dir.join(HISTORY_FILE)
    }

    pub fn best_path(&self) -> PathBuf {
        self.dir
            .join(format!("{BEST_PARAMS_STEM}.{}", self.best_format.extension()))
    }

    pub fn results_path(&self) -> PathBuf {
        self.dir.join(RESULTS_FILE)
    }

    /// Overwrite the history file with the full list of records.
    pub fn save_history(&self, records: &[TrialRecord]) -> Result<(), PersistenceError> {
        let path = self.history_path();
        let bytes = ConfigFormat::Json.encode(records)?;
        write_atomic_with_retry(&path, &bytes)?;
        debug!(path = %path.display(), trials = records.len(), "saved trial history");
        Ok(())
    }

    pub fn save_best(&self, record: &BestRecord) -> Result<(), PersistenceError> {
        let path = self.best_path();
        let bytes = self.best_format.encode(record)?;
        write_atomic_with_retry(&path, &bytes)?;
        debug!(path = %path.display(), score = record.best_score, "saved best parameters");
        Ok(())
    }

    /// Read the best record back; `None` if nothing has been saved yet.
    pub fn load_best(&self) -> Result<Option<BestRecord>, PersistenceError> {
        let path = self.best_path();
        match fs::read(&path) {
            Ok(bytes) => self
                .best_format
                .decode(&bytes)
                .map(Some)
                .map_err(|message| PersistenceError::Decode { path, message }),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(PersistenceError::ReadFailed { path, source }),
        }
    }

    pub fn load_history(&self) -> Result<Vec<TrialRecord>, PersistenceError> {
        let path = self.history_path();
        match fs::read(&path) {
            Ok(bytes) => ConfigFormat::Json
                .decode(&bytes)
                .map_err(|message| PersistenceError::Decode { path, message }),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(source) => Err(PersistenceError::ReadFailed { path, source }),
        }
    }

    pub fn save_results(&self, results: &OptimizationResults) -> Result<(), PersistenceError> {
        let path = self.results_path();
        let bytes = ConfigFormat::Json.encode(results)?;
        write_atomic_with_retry(&path, &bytes)
    }
}
