//! Hosted-notebook detection and threshold adaptation.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

use crate::warnings::Thresholds;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Kaggle,
    Colab,
    Local,
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Kaggle => "kaggle",
            Self::Colab => "colab",
            Self::Local => "local",
        })
    }
}

/// Session limits imposed by the hosting platform. `None` means unbounded.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PlatformLimits {
    pub platform: Platform,
    pub time_limit_hours: Option<f64>,
    pub memory_limit_gb: Option<f64>,
    pub disk_limit_gb: Option<f64>,
}

impl Platform {
    pub fn limits(self) -> PlatformLimits {
        let (time, memory, disk) = match self {
            Self::Kaggle => (Some(12.0), Some(16.0), Some(20.0)),
            Self::Colab => (Some(12.0), Some(12.0), Some(100.0)),
            Self::Local => (None, None, None),
        };
        PlatformLimits {
            platform: self,
            time_limit_hours: time,
            memory_limit_gb: memory,
            disk_limit_gb: disk,
        }
    }
}

const KAGGLE_ROOT: &str = "/kaggle";
const COLAB_ENV_VARS: [&str; 2] = ["COLAB_RELEASE_TAG", "COLAB_GPU"];

/// Detect the current host from the filesystem and environment.
pub fn detect_platform() -> Platform {
    detect_with(Path::new(KAGGLE_ROOT), |name| std::env::var_os(name).is_some())
}

/// Colab signals take precedence when both hosts look present.
fn detect_with(kaggle_root: &Path, env_is_set: impl Fn(&str) -> bool) -> Platform {
    if COLAB_ENV_VARS.iter().any(|name| env_is_set(name)) {
        Platform::Colab
    } else if kaggle_root.is_dir() {
        Platform::Kaggle
    } else {
        Platform::Local
    }
}

/// Tighten `thresholds` for `platform`. Never loosens a threshold.
pub fn adapt_thresholds(thresholds: Thresholds, platform: Platform) -> Thresholds {
    match platform {
        Platform::Kaggle => Thresholds {
            memory_percent: thresholds.memory_percent.min(85.0),
            disk_percent: thresholds.disk_percent.min(90.0),
            ..thresholds
        },
        Platform::Colab => Thresholds {
            gpu_memory_percent: thresholds.gpu_memory_percent.min(90.0),
            ..thresholds
        },
        Platform::Local => thresholds,
    }
}
