//! Trial lifecycle and the persisted trial record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::search::Params;

/// Whether we are maximizing or minimizing the objective.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Maximize,
    Minimize,
}

impl Default for Direction {
    fn default() -> Self {
        Self::Maximize
    }
}

impl Direction {
    /// The worst possible score; failed trials carry it so they never win.
    pub fn worst(self) -> f64 {
        match self {
            Self::Maximize => f64::NEG_INFINITY,
            Self::Minimize => f64::INFINITY,
        }
    }

    /// Strict improvement of `candidate` over `incumbent`.
    pub fn is_better(self, candidate: f64, incumbent: f64) -> bool {
        match self {
            Self::Maximize => candidate > incumbent,
            Self::Minimize => candidate < incumbent,
        }
    }

    /// Order two scores best-first.
    pub fn cmp_best_first(self, a: f64, b: f64) -> std::cmp::Ordering {
        let ord = a.partial_cmp(&b).unwrap_or(std::cmp::Ordering::Equal);
        match self {
            Self::Maximize => ord.reverse(),
            Self::Minimize => ord,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrialStatus {
    Proposed,
    Running,
    Complete,
    Pruned,
    Failed,
}

impl TrialStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Pruned | Self::Failed)
    }
}

/// A single trial: one proposed parameter vector and its outcome.
///
/// Transitions only move forward (`Proposed → Running → terminal`); a call
/// that would leave a terminal state is ignored.
#[derive(Debug, Clone, PartialEq)]
pub struct Trial {
    pub id: u64,
    pub params: Params,
    pub status: TrialStatus,
    /// Final score. `NaN` until the trial reaches a terminal state.
    pub score: f64,
    /// `(step, value)` pairs reported while the scorer ran.
    pub intermediate_values: Vec<(u64, f64)>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl Trial {
    pub fn new(id: u64, params: Params) -> Self {
        Self {
            id,
            params,
            status: TrialStatus::Proposed,
            score: f64::NAN,
            intermediate_values: Vec::new(),
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            error: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Value reported at exactly `step`, if any.
    pub fn value_at(&self, step: u64) -> Option<f64> {
        self.intermediate_values
            .iter()
            .find(|(s, _)| *s == step)
            .map(|(_, v)| *v)
    }

    /// Last value reported at or before `step`.
    pub fn value_at_or_before(&self, step: u64) -> Option<f64> {
        self.intermediate_values
            .iter()
            .rev()
            .find(|(s, _)| *s <= step)
            .map(|(_, v)| *v)
    }

    pub fn mark_running(&mut self) {
        if self.status != TrialStatus::Proposed {
            warn!(trial = self.id, status = ?self.status, "ignoring transition to running");
            return;
        }
        self.status = TrialStatus::Running;
        self.started_at = Some(Utc::now());
    }

    pub fn complete(&mut self, score: f64) {
        self.finish(TrialStatus::Complete, score, None);
    }

    /// Stop early; the last reported value becomes the score.
    pub fn prune(&mut self, score: f64) {
        self.finish(TrialStatus::Pruned, score, None);
    }

    pub fn fail(&mut self, worst_score: f64, error: String) {
        self.finish(TrialStatus::Failed, worst_score, Some(error));
    }

    fn finish(&mut self, status: TrialStatus, score: f64, error: Option<String>) {
        if self.is_terminal() {
            warn!(trial = self.id, status = ?self.status, to = ?status, "trial already terminal");
            return;
        }
        self.status = status;
        self.score = score;
        self.error = error;
        self.finished_at = Some(Utc::now());
    }

    pub fn duration_seconds(&self) -> Option<f64> {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds() as f64 / 1000.0),
            _ => None,
        }
    }
}

/// The on-disk shape of a terminal trial in the history file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialRecord {
    pub id: u64,
    pub status: TrialStatus,
    /// `None` for failed trials, whose worst-possible score is not finite.
    pub score: Option<f64>,
    pub params: Params,
    pub timestamp: DateTime<Utc>,
    pub duration_seconds: Option<f64>,
    /// Whether this trial became the new best when it finished.
    pub is_best: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub intermediate_values: Vec<(u64, f64)>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TrialRecord {
    pub fn from_trial(trial: &Trial, is_best: bool) -> Self {
        Self {
            id: trial.id,
            status: trial.status,
            score: trial.score.is_finite().then_some(trial.score),
            params: trial.params.clone(),
            timestamp: trial.finished_at.unwrap_or(trial.created_at),
            duration_seconds: trial.duration_seconds(),
            is_best,
            intermediate_values: trial.intermediate_values.clone(),
            error: trial.error.clone(),
        }
    }
}
