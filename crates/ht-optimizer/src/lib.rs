//! # ht-optimizer
//!
//! Black-box hyperparameter search for HyperTune.
//!
//! Provides search space definitions, pluggable samplers and pruners, the
//! trial lifecycle, the sequential [`Study`] driver, crash-safe result
//! persistence and parameter importance.

mod config;
mod importance;
mod pruner;
mod sampler;
mod scorer;
mod search;
mod store;
mod study;
mod trial;

pub use config::{MonitorSettings, OptimizerConfig, ScorerSettings, ThresholdOverrides};
pub use importance::param_importance;
pub use pruner::{
    HyperbandPruner, MedianPruner, NopPruner, PercentilePruner, Pruner, PrunerConfig,
};
pub use sampler::{EvolutionSampler, RandomSampler, Sampler, SamplerConfig, TpeSampler};
pub use scorer::{EvalContext, Scorer};
pub use search::{ParamDomain, ParamValue, Params, SearchSpace};
pub use store::{
    BestRecord, OptimizationResults, ResultStore, RunStatistics, RunSummary, BEST_PARAMS_STEM,
    HISTORY_FILE, RESULTS_FILE,
};
pub use study::{CancelFlag, Study, StudySummary, DEFAULT_SEED};
pub use trial::{Direction, Trial, TrialRecord, TrialStatus};
