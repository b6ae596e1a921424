//! Background resource monitor.
//!
//! [`ResourceMonitor::start`] spawns one sampling thread. Every interval it
//! takes a sample, evaluates it against a snapshot of the thresholds taken at
//! start, appends the entry to the bounded history and runs every callback on
//! the sampling thread. [`ResourceMonitor::stop`] wakes the thread from its
//! idle wait and waits a bounded time for it to exit.
//!
//! Each run carries a generation number. A thread that outlives its join
//! timeout has its generation retired under the history lock, so it can
//! never append to the history again. A thread that exits in time records
//! every sample it took.

use chrono::Utc;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use ht_types::{write_atomic_with_retry, ConfigError, ConfigFormat, HtResult, MonitorError};

use crate::history::{MonitorEntry, MonitorHistory, MonitorSummary, DEFAULT_HISTORY_CAP};
use crate::platform::{adapt_thresholds, detect_platform, Platform};
use crate::sample::{PlatformMetrics, ResourceSample, SystemMetricsSource};
use crate::warnings::{evaluate, Thresholds};

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Callback run on the sampling thread after every tick.
pub type MonitorCallback = Arc<dyn Fn(&MonitorEntry) -> anyhow::Result<()> + Send + Sync>;

#[derive(Debug, Clone, PartialEq)]
pub struct MonitorConfig {
    pub thresholds: Thresholds,
    pub history_cap: usize,
    /// How long `stop` waits for the sampling thread before detaching it.
    pub join_timeout: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            thresholds: Thresholds::default(),
            history_cap: DEFAULT_HISTORY_CAP,
            join_timeout: DEFAULT_JOIN_TIMEOUT,
        }
    }
}

impl MonitorConfig {
    pub fn with_thresholds(mut self, thresholds: Thresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    pub fn with_history_cap(mut self, cap: usize) -> Self {
        self.history_cap = cap;
        self
    }

    pub fn with_join_timeout(mut self, timeout: Duration) -> Self {
        self.join_timeout = timeout;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.thresholds.validate()?;
        if self.history_cap == 0 {
            return Err(ConfigError::Invalid(
                "monitor history cap must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// State shared with the sampling thread.
struct Shared {
    source: Arc<dyn SystemMetricsSource>,
    history: RwLock<MonitorHistory>,
    callbacks: RwLock<Vec<MonitorCallback>>,
    generation: AtomicU64,
}

struct RunningLoop {
    generation: u64,
    stop_tx: Sender<()>,
    done_rx: Receiver<()>,
    thread: JoinHandle<()>,
}

/// Monitoring data as written by [`ResourceMonitor::save`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorExport {
    pub saved_at: chrono::DateTime<Utc>,
    pub thresholds: Thresholds,
    pub entries: Vec<MonitorEntry>,
}

pub struct ResourceMonitor {
    shared: Arc<Shared>,
    thresholds: RwLock<Thresholds>,
    join_timeout: Duration,
    running: Mutex<Option<RunningLoop>>,
}

impl ResourceMonitor {
    /// A monitor over the host's own metrics.
    pub fn new(config: MonitorConfig) -> Result<Self, ConfigError> {
        Self::with_source(config, Arc::new(PlatformMetrics::new()))
    }

    pub fn with_source(
        config: MonitorConfig,
        source: Arc<dyn SystemMetricsSource>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            shared: Arc::new(Shared {
                source,
                history: RwLock::new(MonitorHistory::new(config.history_cap)),
                callbacks: RwLock::new(Vec::new()),
                generation: AtomicU64::new(0),
            }),
            thresholds: RwLock::new(config.thresholds),
            join_timeout: config.join_timeout,
            running: Mutex::new(None),
        })
    }

    /// Spawn the sampling thread. The first sample is taken immediately.
    pub fn start(&self, interval: Duration) -> Result<(), MonitorError> {
        if interval.is_zero() {
            return Err(MonitorError::InvalidInterval);
        }
        let mut running = self.running.lock();
        if running.is_some() {
            return Err(MonitorError::AlreadyRunning);
        }

        let thresholds = *self.thresholds.read();
        let generation = self.shared.generation.load(Ordering::SeqCst);
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let (done_tx, done_rx) = bounded::<()>(1);
        let shared = Arc::clone(&self.shared);

        let thread = thread::Builder::new()
            .name("ht-monitor".to_string())
            .spawn(move || {
                run_loop(&shared, thresholds, interval, generation, &stop_rx);
                let _ = done_tx.send(());
            })
            .map_err(|err| MonitorError::SpawnFailed {
                message: err.to_string(),
            })?;

        info!(interval_secs = interval.as_secs_f64(), generation, "resource monitor started");
        *running = Some(RunningLoop {
            generation,
            stop_tx,
            done_rx,
            thread,
        });
        Ok(())
    }

    /// Stop the sampling thread.
    ///
    /// Returns `true` if the thread exited within the join timeout. On
    /// timeout the thread is detached and its later ticks are discarded.
    /// Stopping a stopped monitor is a no-op.
    pub fn stop(&self) -> bool {
        let Some(run) = self.running.lock().take() else {
            debug!("resource monitor not running");
            return true;
        };

        let _ = run.stop_tx.try_send(());

        match run.done_rx.recv_timeout(self.join_timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if run.thread.join().is_err() {
                    error!(generation = run.generation, "monitor thread panicked");
                }
                self.shared.generation.fetch_add(1, Ordering::SeqCst);
                info!(generation = run.generation, "resource monitor stopped");
                true
            }
            Err(RecvTimeoutError::Timeout) => {
                {
                    let _history = self.shared.history.write();
                    self.shared.generation.fetch_add(1, Ordering::SeqCst);
                }
                warn!(
                    generation = run.generation,
                    timeout_secs = self.join_timeout.as_secs_f64(),
                    "monitor thread did not exit in time, detaching"
                );
                false
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Register a callback. Errors and panics it raises are logged and
    /// never stop the loop.
    pub fn add_callback<F>(&self, callback: F)
    where
        F: Fn(&MonitorEntry) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.shared.callbacks.write().push(Arc::new(callback));
    }

    pub fn thresholds(&self) -> Thresholds {
        *self.thresholds.read()
    }

    /// Replace the thresholds. Only allowed while stopped.
    pub fn set_thresholds(&self, thresholds: Thresholds) -> HtResult<()> {
        let running = self.running.lock();
        if running.is_some() {
            return Err(MonitorError::ThresholdsLocked.into());
        }
        thresholds.validate()?;
        *self.thresholds.write() = thresholds;
        Ok(())
    }

    /// Tighten thresholds for the detected platform. Only allowed while
    /// stopped.
    pub fn adapt_to_platform(&self) -> Result<Platform, MonitorError> {
        let platform = detect_platform();
        self.adapt_to(platform)?;
        Ok(platform)
    }

    pub fn adapt_to(&self, platform: Platform) -> Result<Thresholds, MonitorError> {
        let running = self.running.lock();
        if running.is_some() {
            return Err(MonitorError::ThresholdsLocked);
        }
        let mut thresholds = self.thresholds.write();
        *thresholds = adapt_thresholds(*thresholds, platform);
        info!(%platform, thresholds = ?*thresholds, "adapted thresholds to platform");
        Ok(*thresholds)
    }

    /// Snapshot of the history; may trail the sampling thread by one tick.
    pub fn history(&self) -> Vec<MonitorEntry> {
        self.shared.history.read().entries().to_vec()
    }

    pub fn latest(&self) -> Option<MonitorEntry> {
        self.shared.history.read().latest().cloned()
    }

    pub fn summary(&self, window: chrono::Duration) -> Option<MonitorSummary> {
        self.shared.history.read().summary(window)
    }

    /// Write thresholds and history to `path` as JSON.
    pub fn save(&self, path: &Path) -> HtResult<()> {
        let export = MonitorExport {
            saved_at: Utc::now(),
            thresholds: self.thresholds(),
            entries: self.history(),
        };
        let bytes = ConfigFormat::Json.encode(&export)?;
        write_atomic_with_retry(path, &bytes)?;
        info!(path = %path.display(), entries = export.entries.len(), "saved monitoring data");
        Ok(())
    }

    pub fn clear(&self) {
        self.shared.history.write().clear();
    }
}

impl Drop for ResourceMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_loop(
    shared: &Shared,
    thresholds: Thresholds,
    interval: Duration,
    generation: u64,
    stop_rx: &Receiver<()>,
) {
    loop {
        tick(shared, &thresholds, generation);
        match stop_rx.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    debug!(generation, "monitor loop exited");
}

fn tick(shared: &Shared, thresholds: &Thresholds, generation: u64) {
    let sample = ResourceSample::collect(shared.source.as_ref());
    let warnings = evaluate(&sample, thresholds);
    let entry = MonitorEntry { sample, warnings };

    {
        let mut history = shared.history.write();
        if shared.generation.load(Ordering::SeqCst) != generation {
            debug!(generation, "discarding sample from a stopped run");
            return;
        }
        history.push(entry.clone());
    }

    let callbacks = shared.callbacks.read().clone();
    for callback in callbacks {
        match panic::catch_unwind(AssertUnwindSafe(|| callback(&entry))) {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(error = %err, "monitor callback failed"),
            Err(_) => error!("monitor callback panicked"),
        }
    }
}

/// Callback that logs every warning of a tick at `warn` level.
pub fn log_warnings(entry: &MonitorEntry) -> anyhow::Result<()> {
    for warning in &entry.warnings {
        warn!(
            kind = %warning.kind,
            value = warning.value,
            threshold = warning.threshold,
            gpu_id = ?warning.gpu_id,
            "{}",
            warning.message
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::GpuSample;
    use ht_types::{HtError, SampleError};

    struct Fixed(f64);

    impl SystemMetricsSource for Fixed {
        fn cpu_percent(&self) -> Result<f64, SampleError> {
            Ok(self.0)
        }

        fn memory_percent(&self) -> Result<f64, SampleError> {
            Ok(10.0)
        }

        fn disk_percent(&self) -> Result<f64, SampleError> {
            Ok(10.0)
        }

        fn gpu_samples(&self) -> Result<Vec<GpuSample>, SampleError> {
            Ok(Vec::new())
        }
    }

    fn monitor(cpu: f64) -> ResourceMonitor {
        ResourceMonitor::with_source(MonitorConfig::default(), Arc::new(Fixed(cpu))).unwrap()
    }

    fn wait_for(mut cond: impl FnMut() -> bool) {
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(std::time::Instant::now() < deadline, "condition not met in time");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn rejects_zero_interval_and_double_start() {
        let monitor = monitor(1.0);
        assert_eq!(monitor.start(Duration::ZERO), Err(MonitorError::InvalidInterval));
        monitor.start(Duration::from_secs(60)).unwrap();
        assert_eq!(
            monitor.start(Duration::from_secs(60)),
            Err(MonitorError::AlreadyRunning)
        );
        assert!(monitor.stop());
        assert!(!monitor.is_running());
    }

    #[test]
    fn stop_interrupts_long_interval() {
        let monitor = monitor(1.0);
        monitor.start(Duration::from_secs(3600)).unwrap();
        let started = std::time::Instant::now();
        assert!(monitor.stop());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn thresholds_locked_while_running() {
        let monitor = monitor(1.0);
        monitor.start(Duration::from_secs(60)).unwrap();
        let err = monitor
            .set_thresholds(Thresholds::default().with_cpu(10.0))
            .unwrap_err();
        assert!(matches!(err, HtError::Monitor(MonitorError::ThresholdsLocked)));
        assert_eq!(monitor.adapt_to(Platform::Kaggle), Err(MonitorError::ThresholdsLocked));
        monitor.stop();

        monitor
            .set_thresholds(Thresholds::default().with_cpu(10.0))
            .unwrap();
        assert_eq!(monitor.thresholds().cpu_percent, 10.0);
    }

    #[test]
    fn invalid_thresholds_rejected() {
        let monitor = monitor(1.0);
        let err = monitor
            .set_thresholds(Thresholds::default().with_memory(-1.0))
            .unwrap_err();
        assert!(matches!(err, HtError::Config(ConfigError::InvalidThreshold { .. })));
        assert!(ResourceMonitor::with_source(
            MonitorConfig::default().with_history_cap(0),
            Arc::new(Fixed(1.0))
        )
        .is_err());
    }

    #[test]
    fn save_and_clear() {
        let dir = tempfile::tempdir().unwrap();
        let monitor = monitor(99.0);
        monitor.start(Duration::from_secs(60)).unwrap();
        wait_for(|| !monitor.history().is_empty());
        monitor.stop();
        assert_eq!(monitor.history().len(), 1);

        let path = dir.path().join("monitoring/data.json");
        monitor.save(&path).unwrap();
        let export: MonitorExport =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(export.entries.len(), 1);
        assert_eq!(export.entries[0].warnings.len(), 1);
        assert_eq!(export.thresholds, Thresholds::default());

        monitor.clear();
        assert!(monitor.history().is_empty());
        assert!(monitor.latest().is_none());
    }

    #[test]
    fn log_warnings_never_fails() {
        let sample = ResourceSample {
            cpu_percent: Some(99.0),
            ..ResourceSample::empty()
        };
        let warnings = evaluate(&sample, &Thresholds::default());
        assert!(log_warnings(&MonitorEntry { sample, warnings }).is_ok());
    }
}
