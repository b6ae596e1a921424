//! Study configuration, loaded from YAML or JSON.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use ht_types::{load_document, ConfigError, ConfigFormat};

use crate::pruner::PrunerConfig;
use crate::sampler::SamplerConfig;
use crate::search::SearchSpace;
use crate::study::DEFAULT_SEED;
use crate::trial::Direction;

fn default_n_trials() -> usize {
    50
}

fn default_seed() -> u64 {
    DEFAULT_SEED
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("results/optimization")
}

/// Everything needed to build and run a study.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerConfig {
    #[serde(default = "default_n_trials")]
    pub n_trials: usize,
    #[serde(default)]
    pub direction: Direction,
    #[serde(default = "default_seed")]
    pub seed: u64,
    pub search_space: SearchSpace,
    #[serde(default)]
    pub sampler: SamplerConfig,
    #[serde(default)]
    pub pruner: PrunerConfig,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    #[serde(default)]
    pub best_params_format: ConfigFormat,
    #[serde(default)]
    pub monitor: MonitorSettings,
    /// External command used as the scorer by the `ht-search` binary.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scorer: Option<ScorerSettings>,
}

impl OptimizerConfig {
    pub fn new(search_space: SearchSpace) -> Self {
        Self {
            n_trials: default_n_trials(),
            direction: Direction::default(),
            seed: default_seed(),
            search_space,
            sampler: SamplerConfig::default(),
            pruner: PrunerConfig::default(),
            output_dir: default_output_dir(),
            best_params_format: ConfigFormat::default(),
            monitor: MonitorSettings::default(),
            scorer: None,
        }
    }

    pub fn with_trials(mut self, n_trials: usize) -> Self {
        self.n_trials = n_trials;
        self
    }

    pub fn with_direction(mut self, direction: Direction) -> Self {
        self.direction = direction;
        self
    }

    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = dir.into();
        self
    }

    /// Load and validate a config file. The format follows the extension.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let config: Self = load_document(path)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.search_space.validate()?;
        self.sampler.validate()?;
        self.pruner.validate()?;
        self.monitor.validate()?;
        if let Some(scorer) = &self.scorer {
            scorer.validate()?;
        }
        Ok(())
    }
}

/// Threshold overrides for the resource monitor, in percent.
///
/// Unset fields keep the monitor's defaults.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ThresholdOverrides {
    pub cpu_percent: Option<f64>,
    pub memory_percent: Option<f64>,
    pub disk_percent: Option<f64>,
    pub gpu_memory_percent: Option<f64>,
}

impl ThresholdOverrides {
    fn validate(&self) -> Result<(), ConfigError> {
        let fields = [
            ("cpu_percent", self.cpu_percent),
            ("memory_percent", self.memory_percent),
            ("disk_percent", self.disk_percent),
            ("gpu_memory_percent", self.gpu_memory_percent),
        ];
        for (name, value) in fields {
            if let Some(value) = value {
                if !(0.0..=100.0).contains(&value) {
                    return Err(ConfigError::InvalidThreshold {
                        name: name.to_string(),
                        value,
                    });
                }
            }
        }
        Ok(())
    }
}

/// How the binary runs the resource monitor next to the study.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorSettings {
    pub enabled: bool,
    pub interval_secs: f64,
    pub history_cap: usize,
    pub join_timeout_secs: f64,
    pub thresholds: ThresholdOverrides,
    /// Tighten thresholds for the detected hosting platform.
    pub adapt_to_platform: bool,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 30.0,
            history_cap: 1000,
            join_timeout_secs: 5.0,
            thresholds: ThresholdOverrides::default(),
            adapt_to_platform: true,
        }
    }
}

impl MonitorSettings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("interval_secs", self.interval_secs),
            ("join_timeout_secs", self.join_timeout_secs),
        ] {
            if !value.is_finite() || value <= 0.0 {
                return Err(ConfigError::Invalid(format!(
                    "monitor.{name} must be positive, got {value}"
                )));
            }
        }
        if self.history_cap == 0 {
            return Err(ConfigError::Invalid(
                "monitor.history_cap must be at least 1".to_string(),
            ));
        }
        self.thresholds.validate()
    }
}

/// An external program that scores one parameter vector per run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScorerSettings {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Working directory for the child; defaults to the current one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,
}

impl ScorerSettings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.command.trim().is_empty() {
            return Err(ConfigError::Invalid("scorer.command is empty".to_string()));
        }
        Ok(())
    }
}
