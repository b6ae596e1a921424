use std::path::PathBuf;

use thiserror::Error;

/// Main error type for the HyperTune system
#[derive(Error, Debug)]
pub enum HtError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("Monitor error: {0}")]
    Monitor(#[from] MonitorError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Malformed search space, threshold or strategy settings.
///
/// Always raised while building a study or monitor, never from inside a
/// running trial loop.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("Parameter {name}: min ({min}) must be less than or equal to max ({max})")]
    InvalidBounds { name: String, min: f64, max: f64 },

    #[error("Parameter {name}: log scale requires min > 0, got {min}")]
    InvalidLogBounds { name: String, min: f64 },

    #[error("Parameter {name}: bounds must be finite")]
    NonFiniteBound { name: String },

    #[error("Search space has no parameters")]
    EmptySearchSpace,

    #[error("Threshold {name} must be within [0, 100], got {value}")]
    InvalidThreshold { name: String, value: f64 },

    #[error("Invalid {strategy} setting: {message}")]
    InvalidStrategy { strategy: String, message: String },

    #[error("Unsupported config format: {path}")]
    UnsupportedFormat { path: PathBuf },

    #[error("Config file not found: {path}")]
    NotFound { path: PathBuf },

    #[error("Failed to parse {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Durable writes that did not land.
#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("Write to {path} failed after {attempts} attempts: {source}")]
    WriteFailed {
        path: PathBuf,
        attempts: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("Read from {path} failed: {source}")]
    ReadFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Encoding {what} failed: {message}")]
    Encode { what: String, message: String },

    #[error("Decoding {path} failed: {message}")]
    Decode { path: PathBuf, message: String },
}

/// Monitor lifecycle misuse.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MonitorError {
    #[error("Monitor is already running")]
    AlreadyRunning,

    #[error("Thresholds cannot change while the monitor is running")]
    ThresholdsLocked,

    #[error("Sampling interval must be positive")]
    InvalidInterval,

    #[error("Failed to spawn monitor thread: {message}")]
    SpawnFailed { message: String },
}

/// Outcome of a scorer call that did not produce a final score.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EvalError {
    /// The pruner asked the trial to stop at `step`. The study scores the
    /// trial with its last reported intermediate value, not `value`.
    #[error("Trial pruned at step {step} (value {value})")]
    Pruned { step: u64, value: f64 },

    #[error("Evaluation failed: {message}")]
    Failed { message: String },
}

impl EvalError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
        }
    }
}

impl From<String> for EvalError {
    fn from(message: String) -> Self {
        Self::Failed { message }
    }
}

impl From<&str> for EvalError {
    fn from(message: &str) -> Self {
        Self::Failed {
            message: message.to_string(),
        }
    }
}

impl From<std::io::Error> for EvalError {
    fn from(err: std::io::Error) -> Self {
        Self::Failed {
            message: err.to_string(),
        }
    }
}

/// A metric source that could not be read during one monitor tick.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SampleError {
    #[error("{section} metrics unavailable: {reason}")]
    Unavailable { section: String, reason: String },
}

/// Result type alias for HyperTune operations
pub type HtResult<T> = Result<T, HtError>;

/// Macro for creating internal errors
#[macro_export]
macro_rules! internal_error {
    ($($arg:tt)*) => {
        $crate::HtError::Internal(format!($($arg)*))
    };
}

/// Macro for creating configuration errors
#[macro_export]
macro_rules! config_error {
    ($($arg:tt)*) => {
        $crate::ConfigError::Invalid(format!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = ConfigError::InvalidBounds {
            name: "lr".to_string(),
            min: 0.1,
            max: 0.01,
        };

        assert!(error.to_string().contains("lr"));
        assert!(error.to_string().contains("0.1"));
        assert!(error.to_string().contains("0.01"));
    }

    #[test]
    fn test_error_conversion() {
        let config_error = ConfigError::EmptySearchSpace;
        let ht_error: HtError = config_error.into();

        match ht_error {
            HtError::Config(_) => (),
            _ => panic!("Expected Config error"),
        }
    }

    #[test]
    fn eval_error_from_str_is_failure() {
        let err: EvalError = "cuda out of memory".into();
        assert_eq!(err, EvalError::failed("cuda out of memory"));
    }

    #[test]
    fn test_macros() {
        let internal = internal_error!("Something went wrong: {}", 42);
        assert!(matches!(internal, HtError::Internal(_)));
        let config = config_error!("Missing required field: {}", "search_space");
        assert!(config.to_string().contains("search_space"));
    }
}
