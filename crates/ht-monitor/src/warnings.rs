//! Threshold checks over a [`ResourceSample`].

use serde::{Deserialize, Serialize};
use std::fmt;

use ht_types::ConfigError;

use crate::sample::ResourceSample;

/// Usage levels (percent) above which a warning is raised.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub disk_percent: f64,
    pub gpu_memory_percent: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            cpu_percent: 95.0,
            memory_percent: 90.0,
            disk_percent: 95.0,
            gpu_memory_percent: 95.0,
        }
    }
}

impl Thresholds {
    pub fn with_cpu(mut self, percent: f64) -> Self {
        self.cpu_percent = percent;
        self
    }

    pub fn with_memory(mut self, percent: f64) -> Self {
        self.memory_percent = percent;
        self
    }

    pub fn with_disk(mut self, percent: f64) -> Self {
        self.disk_percent = percent;
        self
    }

    pub fn with_gpu_memory(mut self, percent: f64) -> Self {
        self.gpu_memory_percent = percent;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("cpu_percent", self.cpu_percent),
            ("memory_percent", self.memory_percent),
            ("disk_percent", self.disk_percent),
            ("gpu_memory_percent", self.gpu_memory_percent),
        ] {
            if !(0.0..=100.0).contains(&value) {
                return Err(ConfigError::InvalidThreshold {
                    name: name.to_string(),
                    value,
                });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningKind {
    CpuHigh,
    MemoryHigh,
    DiskHigh,
    GpuMemoryHigh,
}

impl WarningKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CpuHigh => "cpu_high",
            Self::MemoryHigh => "memory_high",
            Self::DiskHigh => "disk_high",
            Self::GpuMemoryHigh => "gpu_memory_high",
        }
    }
}

impl fmt::Display for WarningKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A threshold breach found in one sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Warning {
    #[serde(rename = "type")]
    pub kind: WarningKind,
    pub message: String,
    pub value: f64,
    pub threshold: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu_id: Option<u32>,
}

impl Warning {
    fn new(kind: WarningKind, label: &str, value: f64, threshold: f64) -> Self {
        Self {
            kind,
            message: format!("{label} usage high: {value:.1}% (threshold {threshold:.1}%)"),
            value,
            threshold,
            gpu_id: None,
        }
    }
}

/// Compare `sample` against `thresholds`. A value equal to its threshold is
/// not a breach; sections missing from the sample are skipped.
pub fn evaluate(sample: &ResourceSample, thresholds: &Thresholds) -> Vec<Warning> {
    let mut warnings = Vec::new();
    let checks = [
        (WarningKind::CpuHigh, "CPU", sample.cpu_percent, thresholds.cpu_percent),
        (WarningKind::MemoryHigh, "Memory", sample.memory_percent, thresholds.memory_percent),
        (WarningKind::DiskHigh, "Disk", sample.disk_percent, thresholds.disk_percent),
    ];
    for (kind, label, value, threshold) in checks {
        if let Some(value) = value {
            if value > threshold {
                warnings.push(Warning::new(kind, label, value, threshold));
            }
        }
    }

    for gpu in &sample.gpu_samples {
        if gpu.memory_percent > thresholds.gpu_memory_percent {
            let mut warning = Warning::new(
                WarningKind::GpuMemoryHigh,
                &format!("GPU {} memory", gpu.id),
                gpu.memory_percent,
                thresholds.gpu_memory_percent,
            );
            warning.gpu_id = Some(gpu.id);
            warnings.push(warning);
        }
    }
    warnings
}
