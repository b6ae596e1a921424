//! # ht-monitor
//!
//! Background resource monitoring for HyperTune.
//!
//! Samples CPU, memory, disk, accelerator and own-process usage on a fixed
//! interval, raises threshold warnings, keeps a bounded rolling history and
//! dispatches per-tick callbacks, independently of the trial loop.

mod history;
mod monitor;
mod platform;
mod sample;
mod warnings;

pub use history::{MonitorEntry, MonitorHistory, MonitorSummary, Stats, DEFAULT_HISTORY_CAP};
pub use monitor::{
    log_warnings, MonitorCallback, MonitorConfig, MonitorExport, ResourceMonitor,
    DEFAULT_INTERVAL, DEFAULT_JOIN_TIMEOUT,
};
pub use platform::{adapt_thresholds, detect_platform, Platform, PlatformLimits};
pub use sample::{
    parse_nvidia_smi, GpuSample, MetricSection, PlatformMetrics, ProcessSample, ResourceSample,
    SystemMetricsSource,
};
pub use warnings::{evaluate, Thresholds, Warning, WarningKind};
