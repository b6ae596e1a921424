//! The sequential trial driver.

use chrono::Utc;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use ht_types::{ConfigError, EvalError, HtResult};

use crate::config::OptimizerConfig;
use crate::importance::param_importance;
use crate::pruner::{Pruner, PrunerConfig};
use crate::sampler::{Sampler, SamplerConfig};
use crate::scorer::{EvalContext, Scorer};
use crate::search::{Params, SearchSpace};
use crate::store::{BestRecord, OptimizationResults, ResultStore, RunStatistics, RunSummary};
use crate::trial::{Direction, Trial, TrialRecord, TrialStatus};

pub const DEFAULT_SEED: u64 = 42;

/// Cooperative cancellation, checked between trials.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// The shared flag, for handing to signal handlers.
    pub fn as_atomic(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.0)
    }
}

/// Outcome counts and the best result of a study.
#[derive(Debug, Clone, PartialEq)]
pub struct StudySummary {
    pub total_trials: usize,
    pub statistics: RunStatistics,
    pub best_trial_id: Option<u64>,
    pub best_score: Option<f64>,
    pub best_params: Option<Params>,
    pub cancelled: bool,
}

impl StudySummary {
    pub fn has_success(&self) -> bool {
        self.best_score.is_some()
    }
}

impl fmt::Display for StudySummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} trials ({} complete, {} pruned, {} failed)",
            self.total_trials,
            self.statistics.completed_trials,
            self.statistics.pruned_trials,
            self.statistics.failed_trials
        )?;
        match (self.best_trial_id, self.best_score) {
            (Some(id), Some(score)) => write!(f, ", best score {score:.6} at trial {id}")?,
            _ => write!(f, ", no successful trial")?,
        }
        if self.cancelled {
            write!(f, " [cancelled]")?;
        }
        Ok(())
    }
}

/// Runs trials one at a time, tracks the best and persists as it goes.
///
/// `trials` keeps creation order. The best trial is an index into it and only
/// ever points at a `Complete` trial.
pub struct Study {
    id: Uuid,
    direction: Direction,
    space: SearchSpace,
    sampler: Box<dyn Sampler>,
    pruner: Box<dyn Pruner>,
    store: Option<ResultStore>,
    trials: Vec<Trial>,
    records: Vec<TrialRecord>,
    best_index: Option<usize>,
    next_trial_id: u64,
    cancelled: bool,
}

impl fmt::Debug for Study {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Study")
            .field("id", &self.id)
            .field("direction", &self.direction)
            .field("sampler", &self.sampler.name())
            .field("pruner", &self.pruner.name())
            .field("trials", &self.trials.len())
            .field("best_index", &self.best_index)
            .finish()
    }
}

impl Study {
    /// A study with the default TPE sampler and median pruner and no
    /// persistence. Fails if the search space is invalid.
    pub fn new(space: SearchSpace, direction: Direction) -> Result<Self, ConfigError> {
        space.validate()?;
        Ok(Self {
            id: Uuid::new_v4(),
            direction,
            space,
            sampler: SamplerConfig::default().build(direction, DEFAULT_SEED),
            pruner: PrunerConfig::default().build(direction),
            store: None,
            trials: Vec::new(),
            records: Vec::new(),
            best_index: None,
            next_trial_id: 0,
            cancelled: false,
        })
    }

    pub fn from_config(config: &OptimizerConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let store = ResultStore::new(&config.output_dir).with_best_format(config.best_params_format);
        Ok(Self::new(config.search_space.clone(), config.direction)?
            .with_sampler(config.sampler.build(config.direction, config.seed))
            .with_pruner(config.pruner.build(config.direction))
            .with_store(store))
    }

    pub fn with_sampler(mut self, sampler: Box<dyn Sampler>) -> Self {
        self.sampler = sampler;
        self
    }

    pub fn with_pruner(mut self, pruner: Box<dyn Pruner>) -> Self {
        self.pruner = pruner;
        self
    }

    pub fn with_store(mut self, store: ResultStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn search_space(&self) -> &SearchSpace {
        &self.space
    }

    pub fn store(&self) -> Option<&ResultStore> {
        self.store.as_ref()
    }

    /// Every terminal trial, in creation order.
    pub fn trials(&self) -> &[Trial] {
        &self.trials
    }

    pub fn best_trial(&self) -> Option<&Trial> {
        self.best_index.map(|i| &self.trials[i])
    }

    /// Run up to `n_trials` more trials.
    ///
    /// Scorer errors and panics fail the trial and the loop moves on. A
    /// persistence failure that survives its retry stops the study and is
    /// returned. `cancel` is checked before each trial; an in-flight trial
    /// always finishes.
    pub fn optimize<S>(
        &mut self,
        n_trials: usize,
        scorer: &mut S,
        cancel: Option<&CancelFlag>,
    ) -> HtResult<StudySummary>
    where
        S: Scorer + ?Sized,
    {
        info!(
            study = %self.id,
            n_trials,
            sampler = self.sampler.name(),
            pruner = self.pruner.name(),
            direction = ?self.direction,
            "starting optimization"
        );
        let started = Instant::now();
        self.cancelled = false;

        for _ in 0..n_trials {
            if cancel.map_or(false, CancelFlag::is_cancelled) {
                warn!(study = %self.id, finished = self.trials.len(), "optimization cancelled");
                self.cancelled = true;
                break;
            }
            self.run_trial(scorer)?;
        }

        let summary = self.summary();
        if let Some(store) = &self.store {
            store.save_results(&OptimizationResults {
                summary: RunSummary {
                    total_trials: summary.total_trials,
                    best_score: summary.best_score,
                    best_params: summary.best_params.clone(),
                    elapsed_seconds: started.elapsed().as_secs_f64(),
                    timestamp: Utc::now(),
                    cancelled: summary.cancelled,
                },
                statistics: summary.statistics,
                parameter_importance: param_importance(&self.trials),
            })?;
        }
        info!(study = %self.id, elapsed_secs = started.elapsed().as_secs_f64(), "{summary}");
        Ok(summary)
    }

    fn run_trial<S>(&mut self, scorer: &mut S) -> HtResult<()>
    where
        S: Scorer + ?Sized,
    {
        let id = self.next_trial_id;
        self.next_trial_id += 1;

        let params = self.sampler.propose(id, &self.space, &self.trials);
        let mut trial = Trial::new(id, params);
        trial.mark_running();
        debug!(trial = id, params = ?trial.params, "running trial");

        let worst = self.direction.worst();
        if !self.space.contains(&trial.params) {
            error!(trial = id, sampler = self.sampler.name(), "sampler proposed parameters outside the search space");
            trial.fail(worst, "proposed parameters outside the search space".to_string());
        } else {
            let mut ctx = EvalContext::new(id, self.pruner.as_ref(), &self.trials);
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                scorer.evaluate(&trial.params, &mut ctx)
            }));
            trial.intermediate_values = ctx.into_intermediate_values();

            match outcome {
                Ok(Ok(score)) if score.is_finite() => trial.complete(score),
                Ok(Ok(score)) => trial.fail(worst, format!("scorer returned non-finite score {score}")),
                // The pruned score is the last value the scorer reported
                Ok(Err(EvalError::Pruned { step, .. })) => match trial.intermediate_values.last() {
                    Some(&(last_step, value)) => {
                        debug!(trial = id, step, last_step, value, "trial pruned");
                        trial.prune(value);
                    }
                    None => trial.fail(worst, format!("pruned at step {step} without a reported value")),
                },
                Ok(Err(EvalError::Failed { message })) => trial.fail(worst, message),
                Err(payload) => trial.fail(worst, format!("scorer panicked: {}", panic_message(&*payload))),
            }
        }

        self.record(trial)
    }

    /// Append a terminal trial, update the best and persist.
    fn record(&mut self, trial: Trial) -> HtResult<()> {
        let improved = trial.status == TrialStatus::Complete
            && self
                .best_trial()
                .map_or(true, |best| self.direction.is_better(trial.score, best.score));

        match trial.status {
            TrialStatus::Complete => info!(trial = trial.id, score = trial.score, improved, "trial complete"),
            TrialStatus::Pruned => info!(trial = trial.id, score = trial.score, "trial pruned"),
            _ => warn!(trial = trial.id, error = trial.error.as_deref().unwrap_or(""), "trial failed"),
        }

        self.records.push(TrialRecord::from_trial(&trial, improved));
        self.trials.push(trial);
        if improved {
            let index = self.trials.len() - 1;
            self.best_index = Some(index);
            if let Some(store) = &self.store {
                let best = &self.trials[index];
                store.save_best(&BestRecord {
                    best_score: best.score,
                    best_parameters: best.params.clone(),
                    timestamp: Utc::now(),
                    total_trials: self.trials.len(),
                })?;
            }
        }
        if let Some(store) = &self.store {
            store.save_history(&self.records)?;
        }
        Ok(())
    }

    pub fn summary(&self) -> StudySummary {
        let mut statistics = RunStatistics::default();
        for trial in &self.trials {
            match trial.status {
                TrialStatus::Complete => statistics.completed_trials += 1,
                TrialStatus::Pruned => statistics.pruned_trials += 1,
                TrialStatus::Failed => statistics.failed_trials += 1,
                TrialStatus::Proposed | TrialStatus::Running => {}
            }
        }
        let best = self.best_trial();
        StudySummary {
            total_trials: self.trials.len(),
            statistics,
            best_trial_id: best.map(|t| t.id),
            best_score: best.map(|t| t.score),
            best_params: best.map(|t| t.params.clone()),
            cancelled: self.cancelled,
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sampler::RandomSampler;
    use crate::search::ParamValue;

    fn space() -> SearchSpace {
        SearchSpace::new().add_float("x", 0.0, 1.0)
    }

    fn study(direction: Direction) -> Study {
        Study::new(space(), direction)
            .unwrap()
            .with_sampler(Box::new(RandomSampler::new(7)))
    }

    #[test]
    fn rejects_invalid_space_at_construction() {
        let err = Study::new(SearchSpace::new().add_float("x", 2.0, 1.0), Direction::Maximize)
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidBounds { .. }));
    }

    #[test]
    fn minimize_tracks_lowest_score() {
        let mut study = study(Direction::Minimize);
        let mut scores = vec![0.4, 0.1, 0.3].into_iter();
        let mut scorer =
            |_: &Params, _: &mut EvalContext<'_>| -> Result<f64, EvalError> { Ok(scores.next().unwrap()) };
        let summary = study.optimize(3, &mut scorer, None).unwrap();
        assert_eq!(summary.best_score, Some(0.1));
        assert_eq!(summary.best_trial_id, Some(1));
    }

    #[test]
    fn non_finite_score_fails_the_trial() {
        let mut study = study(Direction::Maximize);
        let mut scorer =
            |_: &Params, _: &mut EvalContext<'_>| -> Result<f64, EvalError> { Ok(f64::NAN) };
        let summary = study.optimize(2, &mut scorer, None).unwrap();
        assert_eq!(summary.statistics.failed_trials, 2);
        assert!(!summary.has_success());
        assert!(summary.to_string().contains("no successful trial"));
    }

    #[test]
    fn ties_do_not_replace_the_best() {
        let mut study = study(Direction::Maximize);
        let mut scorer =
            |_: &Params, _: &mut EvalContext<'_>| -> Result<f64, EvalError> { Ok(0.5) };
        study.optimize(3, &mut scorer, None).unwrap();
        assert_eq!(study.best_trial().map(|t| t.id), Some(0));
    }

    #[test]
    fn trial_ids_are_monotonic_across_calls() {
        let mut study = study(Direction::Maximize);
        let mut scorer = |p: &Params, _: &mut EvalContext<'_>| -> Result<f64, EvalError> {
            match p["x"] {
                ParamValue::Float(x) => Ok(x),
                ParamValue::Int(_) => Err(EvalError::failed("int")),
            }
        };
        study.optimize(2, &mut scorer, None).unwrap();
        study.optimize(2, &mut scorer, None).unwrap();
        let ids: Vec<u64> = study.trials().iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![0, 1, 2, 3]);
    }

    #[test]
    fn summary_display_reports_best() {
        let summary = StudySummary {
            total_trials: 3,
            statistics: RunStatistics {
                completed_trials: 2,
                pruned_trials: 0,
                failed_trials: 1,
            },
            best_trial_id: Some(1),
            best_score: Some(0.9),
            best_params: None,
            cancelled: false,
        };
        assert_eq!(
            summary.to_string(),
            "3 trials (2 complete, 0 pruned, 1 failed), best score 0.900000 at trial 1"
        );
    }

    #[test]
    fn cancel_flag_is_shared() {
        let flag = CancelFlag::new();
        let clone = flag.clone();
        assert!(!flag.is_cancelled());
        clone.cancel();
        assert!(flag.is_cancelled());
        assert!(flag.as_atomic().load(Ordering::SeqCst));
    }
}
