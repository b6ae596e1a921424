//! Bounded rolling history of monitor ticks.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::sample::ResourceSample;
use crate::warnings::{Warning, WarningKind};

pub const DEFAULT_HISTORY_CAP: usize = 1000;

/// One tick: the sample and the warnings it raised.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorEntry {
    pub sample: ResourceSample,
    pub warnings: Vec<Warning>,
}

/// Entries in arrival order. Never longer than `cap`: a push that would
/// exceed it keeps only the most recent `cap / 2` entries.
#[derive(Debug, Clone)]
pub struct MonitorHistory {
    entries: Vec<MonitorEntry>,
    cap: usize,
}

impl Default for MonitorHistory {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAP)
    }
}

impl MonitorHistory {
    pub fn new(cap: usize) -> Self {
        Self {
            entries: Vec::new(),
            cap: cap.max(1),
        }
    }

    pub fn cap(&self) -> usize {
        self.cap
    }

    pub fn push(&mut self, entry: MonitorEntry) {
        self.entries.push(entry);
        if self.entries.len() > self.cap {
            let keep = (self.cap / 2).max(1);
            let drop = self.entries.len() - keep;
            self.entries.drain(..drop);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[MonitorEntry] {
        &self.entries
    }

    pub fn latest(&self) -> Option<&MonitorEntry> {
        self.entries.last()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Aggregate the entries sampled within `window` of now.
    pub fn summary(&self, window: Duration) -> Option<MonitorSummary> {
        self.summary_at(window, Utc::now())
    }

    pub fn summary_at(&self, window: Duration, now: DateTime<Utc>) -> Option<MonitorSummary> {
        let cutoff = now - window;
        let recent: Vec<&MonitorEntry> = self
            .entries
            .iter()
            .filter(|e| e.sample.timestamp >= cutoff)
            .collect();
        if recent.is_empty() {
            return None;
        }

        let cpu: Vec<f64> = recent.iter().filter_map(|e| e.sample.cpu_percent).collect();
        let memory: Vec<f64> = recent.iter().filter_map(|e| e.sample.memory_percent).collect();
        let gpu_memory: Vec<f64> = recent
            .iter()
            .flat_map(|e| e.sample.gpu_samples.iter().map(|g| g.memory_percent))
            .collect();

        let mut warnings = BTreeMap::new();
        for warning in recent.iter().flat_map(|e| &e.warnings) {
            *warnings.entry(warning.kind).or_insert(0) += 1;
        }

        Some(MonitorSummary {
            window_seconds: window.num_seconds(),
            data_points: recent.len(),
            cpu: Stats::from_values(&cpu),
            memory: Stats::from_values(&memory),
            gpu_memory: Stats::from_values(&gpu_memory),
            warnings,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Stats {
    pub min: f64,
    pub max: f64,
    pub avg: f64,
    pub count: usize,
}

impl Stats {
    pub fn from_values(values: &[f64]) -> Option<Self> {
        if values.is_empty() {
            return None;
        }
        let min = values.iter().copied().fold(f64::INFINITY, f64::min);
        let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let avg = values.iter().sum::<f64>() / values.len() as f64;
        Some(Self {
            min,
            max,
            avg,
            count: values.len(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorSummary {
    pub window_seconds: i64,
    pub data_points: usize,
    pub cpu: Option<Stats>,
    pub memory: Option<Stats>,
    pub gpu_memory: Option<Stats>,
    pub warnings: BTreeMap<WarningKind, usize>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::GpuSample;
    use crate::warnings::{evaluate, Thresholds};

    fn entry(cpu: f64, at: DateTime<Utc>) -> MonitorEntry {
        let sample = ResourceSample {
            timestamp: at,
            cpu_percent: Some(cpu),
            memory_percent: Some(50.0),
            ..ResourceSample::empty()
        };
        let warnings = evaluate(&sample, &Thresholds::default().with_cpu(60.0));
        MonitorEntry { sample, warnings }
    }

    #[test]
    fn cap_keeps_most_recent_half() {
        let now = Utc::now();
        let mut history = MonitorHistory::new(10);
        for i in 0..11 {
            history.push(entry(i as f64, now));
            assert!(history.len() <= 10);
        }
        assert_eq!(history.len(), 5);
        let cpus: Vec<f64> = history
            .entries()
            .iter()
            .filter_map(|e| e.sample.cpu_percent)
            .collect();
        assert_eq!(cpus, vec![6.0, 7.0, 8.0, 9.0, 10.0]);
        assert_eq!(history.latest().unwrap().sample.cpu_percent, Some(10.0));
    }

    #[test]
    fn default_cap_trims_to_five_hundred() {
        let now = Utc::now();
        let mut history = MonitorHistory::default();
        for i in 0..1001 {
            history.push(entry(i as f64, now));
        }
        assert_eq!(history.len(), 500);
        assert_eq!(history.entries()[0].sample.cpu_percent, Some(501.0));
    }

    #[test]
    fn cap_of_one_keeps_latest() {
        let now = Utc::now();
        let mut history = MonitorHistory::new(1);
        history.push(entry(1.0, now));
        history.push(entry(2.0, now));
        assert_eq!(history.len(), 1);
        assert_eq!(history.latest().unwrap().sample.cpu_percent, Some(2.0));
    }

    #[test]
    fn summary_over_window() {
        let now = Utc::now();
        let mut history = MonitorHistory::new(100);
        history.push(entry(90.0, now - Duration::hours(3)));
        history.push(entry(40.0, now - Duration::minutes(20)));
        let mut gpu = entry(80.0, now - Duration::minutes(5));
        gpu.sample.gpu_samples = vec![GpuSample::new(0, 512.0, 1024.0)];
        history.push(gpu);

        let summary = history.summary_at(Duration::hours(1), now).unwrap();
        assert_eq!(summary.data_points, 2);
        assert_eq!(
            summary.cpu,
            Some(Stats {
                min: 40.0,
                max: 80.0,
                avg: 60.0,
                count: 2
            })
        );
        assert_eq!(summary.gpu_memory.unwrap().avg, 50.0);
        assert_eq!(summary.warnings.get(&WarningKind::CpuHigh), Some(&1));
        assert_eq!(summary.warnings.len(), 1);
    }

    #[test]
    fn summary_none_without_recent_data() {
        let now = Utc::now();
        let mut history = MonitorHistory::new(10);
        assert!(history.summary(Duration::hours(1)).is_none());
        history.push(entry(10.0, now - Duration::hours(2)));
        assert!(history.summary_at(Duration::hours(1), now).is_none());
    }
}
