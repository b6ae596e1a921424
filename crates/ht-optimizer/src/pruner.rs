//! Pruners: strategies that stop unpromising trials early.
//!
//! A pruner is consulted from inside the scorer, each time it reports an
//! intermediate value through [`EvalContext::report`](crate::EvalContext::report).
//! No pruner fires before its startup trial count has completed nor before
//! its minimum step.

use serde::{Deserialize, Serialize};

use ht_types::ConfigError;

use crate::trial::{Direction, Trial, TrialStatus};

/// Trait for pluggable trial pruning strategies.
pub trait Pruner: Send {
    /// Decide whether trial `trial_id` should stop after reporting `value` at
    /// `step`. `history` holds every terminal trial so far.
    fn should_prune(&self, trial_id: u64, step: u64, value: f64, history: &[Trial]) -> bool;

    fn name(&self) -> &str;
}

fn count_complete(history: &[Trial]) -> usize {
    history
        .iter()
        .filter(|t| t.status == TrialStatus::Complete)
        .count()
}

/// Linear-interpolated percentile of `values` (`q` in [0, 100]).
fn percentile(values: &mut [f64], q: f64) -> f64 {
    values.sort_unstable_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let rank = (q / 100.0) * (values.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    let weight = rank - lower as f64;
    values[lower] * (1.0 - weight) + values[upper] * weight
}

// ---- Nop ----

/// Never prunes.
#[derive(Debug, Clone, Copy, Default)]
pub struct NopPruner;

impl Pruner for NopPruner {
    fn should_prune(&self, _trial_id: u64, _step: u64, _value: f64, _history: &[Trial]) -> bool {
        false
    }

    fn name(&self) -> &str {
        "none"
    }
}

// ---- Percentile ----

/// Prune trials outside the best `percentile`% of completed trials at the
/// same step.
#[derive(Debug, Clone)]
pub struct PercentilePruner {
    direction: Direction,
    percentile: f64,
    n_startup_trials: usize,
    n_warmup_steps: u64,
    interval_steps: u64,
}

impl PercentilePruner {
    pub fn new(direction: Direction, percentile: f64) -> Self {
        Self {
            direction,
            percentile,
            n_startup_trials: 5,
            n_warmup_steps: 0,
            interval_steps: 1,
        }
    }

    pub fn with_startup_trials(mut self, n: usize) -> Self {
        self.n_startup_trials = n;
        self
    }

    pub fn with_warmup_steps(mut self, n: u64) -> Self {
        self.n_warmup_steps = n;
        self
    }

    pub fn with_interval_steps(mut self, n: u64) -> Self {
        self.interval_steps = n.max(1);
        self
    }
}

impl Pruner for PercentilePruner {
    fn should_prune(&self, _trial_id: u64, step: u64, value: f64, history: &[Trial]) -> bool {
        if count_complete(history) < self.n_startup_trials || step < self.n_warmup_steps {
            return false;
        }
        if (step - self.n_warmup_steps) % self.interval_steps != 0 {
            return false;
        }
        if value.is_nan() {
            return true;
        }

        let mut values_at_step: Vec<f64> = history
            .iter()
            .filter(|t| t.status == TrialStatus::Complete)
            .filter_map(|t| t.value_at(step))
            .filter(|v| !v.is_nan())
            .collect();
        if values_at_step.is_empty() {
            return false;
        }

        match self.direction {
            Direction::Maximize => {
                value < percentile(&mut values_at_step, 100.0 - self.percentile)
            }
            Direction::Minimize => value > percentile(&mut values_at_step, self.percentile),
        }
    }

    fn name(&self) -> &str {
        "percentile"
    }
}

// ---- Median ----

/// Prune trials worse than the median of completed trials at the same step.
#[derive(Debug, Clone)]
pub struct MedianPruner {
    inner: PercentilePruner,
}

impl MedianPruner {
    pub fn new(direction: Direction) -> Self {
        Self {
            inner: PercentilePruner::new(direction, 50.0),
        }
    }

    pub fn with_startup_trials(mut self, n: usize) -> Self {
        self.inner = self.inner.with_startup_trials(n);
        self
    }

    pub fn with_warmup_steps(mut self, n: u64) -> Self {
        self.inner = self.inner.with_warmup_steps(n);
        self
    }

    pub fn with_interval_steps(mut self, n: u64) -> Self {
        self.inner = self.inner.with_interval_steps(n);
        self
    }
}

impl Pruner for MedianPruner {
    fn should_prune(&self, trial_id: u64, step: u64, value: f64, history: &[Trial]) -> bool {
        self.inner.should_prune(trial_id, step, value, history)
    }

    fn name(&self) -> &str {
        "median"
    }
}

// ---- Hyperband ----

/// Multi-rung resource allocation over several successive-halving brackets.
///
/// Trial `n` runs in bracket `n % n_brackets`, so consecutive trials cycle
/// through the brackets and the pruner keeps no per-trial state.
/// Bracket `b` has rungs at `min_resource * eta^(b + k)` up to
/// `max_resource`; at each rung a trial survives only if it ranks within the
/// best `1/eta` of the trials of its bracket that reached that rung.
#[derive(Debug)]
pub struct HyperbandPruner {
    direction: Direction,
    min_resource: u64,
    max_resource: u64,
    reduction_factor: u64,
    n_startup_trials: usize,
}

impl HyperbandPruner {
    pub fn new(direction: Direction) -> Self {
        Self {
            direction,
            min_resource: 10,
            max_resource: 100,
            reduction_factor: 3,
            n_startup_trials: 0,
        }
    }

    pub fn with_resources(mut self, min_resource: u64, max_resource: u64) -> Self {
        self.min_resource = min_resource.max(1);
        self.max_resource = max_resource.max(self.min_resource);
        self
    }

    pub fn with_reduction_factor(mut self, eta: u64) -> Self {
        self.reduction_factor = eta.max(2);
        self
    }

    pub fn with_startup_trials(mut self, n: usize) -> Self {
        self.n_startup_trials = n;
        self
    }

    /// `floor(log_eta(max / min)) + 1`, counted in integers.
    fn n_brackets(&self) -> usize {
        let mut n = 0;
        let mut resource = self.min_resource;
        while resource <= self.max_resource {
            n += 1;
            match resource.checked_mul(self.reduction_factor) {
                Some(next) => resource = next,
                None => break,
            }
        }
        n.max(1)
    }

    fn bracket_of(&self, trial_id: u64) -> usize {
        (trial_id % self.n_brackets() as u64) as usize
    }

    /// Highest rung of `bracket` at or below `step`.
    fn rung_for(&self, bracket: usize, step: u64) -> Option<u64> {
        let mut rung = self
            .min_resource
            .checked_mul(self.reduction_factor.checked_pow(bracket as u32)?)?;
        let mut current = None;
        while rung <= step && rung <= self.max_resource {
            current = Some(rung);
            rung = rung.checked_mul(self.reduction_factor)?;
        }
        current
    }
}

impl Pruner for HyperbandPruner {
    fn should_prune(&self, trial_id: u64, step: u64, value: f64, history: &[Trial]) -> bool {
        let bracket = self.bracket_of(trial_id);
        if count_complete(history) < self.n_startup_trials || step < self.min_resource {
            return false;
        }
        let Some(rung) = self.rung_for(bracket, step) else {
            return false;
        };
        // The last rung is the full budget
        if rung >= self.max_resource {
            return false;
        }
        if value.is_nan() {
            return true;
        }

        let peers: Vec<f64> = history
            .iter()
            .filter(|t| matches!(t.status, TrialStatus::Complete | TrialStatus::Pruned))
            .filter(|t| self.bracket_of(t.id) == bracket)
            .filter(|t| t.intermediate_values.iter().any(|(s, _)| *s >= rung))
            .filter_map(|t| t.value_at_or_before(rung))
            .filter(|v| !v.is_nan())
            .collect();
        if (peers.len() as u64) < self.reduction_factor {
            return false;
        }

        let better = peers
            .iter()
            .filter(|&&v| self.direction.is_better(v, value))
            .count();
        let survivors = ((peers.len() + 1) as u64 / self.reduction_factor).max(1) as usize;
        better >= survivors
    }

    fn name(&self) -> &str {
        "hyperband"
    }
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

fn default_startup_trials() -> usize {
    5
}

fn default_warmup_steps() -> u64 {
    30
}

fn default_interval_steps() -> u64 {
    10
}

fn default_percentile() -> f64 {
    25.0
}

fn default_min_resource() -> u64 {
    10
}

fn default_max_resource() -> u64 {
    100
}

fn default_reduction_factor() -> u64 {
    3
}

/// Which pruner to build, and its knobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum PrunerConfig {
    None,
    Median {
        #[serde(default = "default_startup_trials")]
        n_startup_trials: usize,
        #[serde(default = "default_warmup_steps")]
        n_warmup_steps: u64,
        #[serde(default = "default_interval_steps")]
        interval_steps: u64,
    },
    Percentile {
        #[serde(default = "default_percentile")]
        percentile: f64,
        #[serde(default = "default_startup_trials")]
        n_startup_trials: usize,
        #[serde(default = "default_warmup_steps")]
        n_warmup_steps: u64,
    },
    Hyperband {
        #[serde(default = "default_min_resource")]
        min_resource: u64,
        #[serde(default = "default_max_resource")]
        max_resource: u64,
        #[serde(default = "default_reduction_factor")]
        reduction_factor: u64,
    },
}

impl Default for PrunerConfig {
    fn default() -> Self {
        Self::Median {
            n_startup_trials: default_startup_trials(),
            n_warmup_steps: default_warmup_steps(),
            interval_steps: default_interval_steps(),
        }
    }
}

impl PrunerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |message: String| ConfigError::InvalidStrategy {
            strategy: "pruner".to_string(),
            message,
        };
        match *self {
            Self::Percentile { percentile, .. } if !(percentile > 0.0 && percentile < 100.0) => {
                Err(invalid(format!("percentile must be in (0, 100), got {percentile}")))
            }
            Self::Median { interval_steps, .. } if interval_steps == 0 => {
                Err(invalid("interval_steps must be at least 1".to_string()))
            }
            Self::Hyperband {
                min_resource,
                max_resource,
                reduction_factor,
            } => {
                if min_resource == 0 || max_resource < min_resource {
                    Err(invalid(format!(
                        "need 0 < min_resource <= max_resource, got {min_resource} and {max_resource}"
                    )))
                } else if reduction_factor < 2 {
                    Err(invalid(format!(
                        "reduction_factor must be at least 2, got {reduction_factor}"
                    )))
                } else {
                    Ok(())
                }
            }
            _ => Ok(()),
        }
    }

    pub fn build(&self, direction: Direction) -> Box<dyn Pruner> {
        match *self {
            Self::None => Box::new(NopPruner),
            Self::Median {
                n_startup_trials,
                n_warmup_steps,
                interval_steps,
            } => Box::new(
                MedianPruner::new(direction)
                    .with_startup_trials(n_startup_trials)
                    .with_warmup_steps(n_warmup_steps)
                    .with_interval_steps(interval_steps),
            ),
            Self::Percentile {
                percentile,
                n_startup_trials,
                n_warmup_steps,
            } => Box::new(
                PercentilePruner::new(direction, percentile)
                    .with_startup_trials(n_startup_trials)
                    .with_warmup_steps(n_warmup_steps),
            ),
            Self::Hyperband {
                min_resource,
                max_resource,
                reduction_factor,
            } => Box::new(
                HyperbandPruner::new(direction)
                    .with_resources(min_resource, max_resource)
                    .with_reduction_factor(reduction_factor),
            ),
        }
    }
}
