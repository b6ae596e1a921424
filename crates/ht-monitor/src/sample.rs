//! Resource samples and the sources that produce them.
//!
//! A source reports each section on its own. A section that cannot be read
//! is left empty and noted in [`ResourceSample::unavailable`]; a sample is
//! never dropped because one section failed.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Command;
use sysinfo::{Disks, System};
use tracing::debug;

use ht_types::SampleError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricSection {
    Cpu,
    Memory,
    Disk,
    Gpu,
    Process,
}

impl MetricSection {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cpu => "cpu",
            Self::Memory => "memory",
            Self::Disk => "disk",
            Self::Gpu => "gpu",
            Self::Process => "process",
        }
    }

    pub fn unavailable(self, reason: impl Into<String>) -> SampleError {
        SampleError::Unavailable {
            section: self.as_str().to_string(),
            reason: reason.into(),
        }
    }
}

impl fmt::Display for MetricSection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Memory usage of one accelerator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpuSample {
    pub id: u32,
    pub memory_used_mb: f64,
    pub memory_total_mb: f64,
    pub memory_percent: f64,
}

impl GpuSample {
    pub fn new(id: u32, memory_used_mb: f64, memory_total_mb: f64) -> Self {
        let memory_percent = if memory_total_mb > 0.0 {
            memory_used_mb / memory_total_mb * 100.0
        } else {
            0.0
        };
        Self {
            id,
            memory_used_mb,
            memory_total_mb,
            memory_percent,
        }
    }
}

/// Usage of the monitoring process itself.
///
/// `cpu_percent` is relative to one core and reads 0 on the first sample,
/// since it is a delta between refreshes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessSample {
    pub pid: u32,
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub memory_rss_mb: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_threads: Option<usize>,
}

/// One observation of system state. Percentages are in [0, 100].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSample {
    pub timestamp: DateTime<Utc>,
    pub cpu_percent: Option<f64>,
    pub memory_percent: Option<f64>,
    pub disk_percent: Option<f64>,
    #[serde(default)]
    pub gpu_samples: Vec<GpuSample>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process: Option<ProcessSample>,
    /// Sections that could not be read, with the reason.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub unavailable: BTreeMap<MetricSection, String>,
}

impl ResourceSample {
    pub fn empty() -> Self {
        Self {
            timestamp: Utc::now(),
            cpu_percent: None,
            memory_percent: None,
            disk_percent: None,
            gpu_samples: Vec::new(),
            process: None,
            unavailable: BTreeMap::new(),
        }
    }

    /// Query every section of `source`, keeping whatever succeeded.
    pub fn collect(source: &dyn SystemMetricsSource) -> Self {
        let mut sample = Self::empty();
        sample.cpu_percent = sample.keep(MetricSection::Cpu, source.cpu_percent());
        sample.memory_percent = sample.keep(MetricSection::Memory, source.memory_percent());
        sample.disk_percent = sample.keep(MetricSection::Disk, source.disk_percent());
        sample.gpu_samples = sample
            .keep(MetricSection::Gpu, source.gpu_samples())
            .unwrap_or_default();
        sample.process = sample.keep(MetricSection::Process, source.process()).flatten();
        sample
    }

    fn keep<T>(&mut self, section: MetricSection, result: Result<T, SampleError>) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(err) => {
                debug!(section = %section, error = %err, "metric section unavailable");
                let reason = match err {
                    SampleError::Unavailable { reason, .. } => reason,
                };
                self.unavailable.insert(section, reason);
                None
            }
        }
    }

    pub fn is_available(&self, section: MetricSection) -> bool {
        !self.unavailable.contains_key(&section)
    }
}

/// Where samples come from. Every method may fail independently.
pub trait SystemMetricsSource: Send + Sync {
    fn cpu_percent(&self) -> Result<f64, SampleError>;

    fn memory_percent(&self) -> Result<f64, SampleError>;

    fn disk_percent(&self) -> Result<f64, SampleError>;

    /// One entry per accelerator; an empty list means none are installed.
    fn gpu_samples(&self) -> Result<Vec<GpuSample>, SampleError>;

    /// The monitoring process. `None` for sources that do not track it.
    fn process(&self) -> Result<Option<ProcessSample>, SampleError> {
        Ok(None)
    }
}

/// Host metrics via `sysinfo`, accelerators via `nvidia-smi`.
pub struct PlatformMetrics {
    system: Mutex<System>,
    disk_path: PathBuf,
    nvidia_smi: PathBuf,
}

impl PlatformMetrics {
    pub fn new() -> Self {
        let mut system = System::new();
        // CPU usage is a delta between two refreshes
        system.refresh_cpu();
        std::thread::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL);
        system.refresh_cpu();
        Self {
            system: Mutex::new(system),
            disk_path: PathBuf::from("/"),
            nvidia_smi: PathBuf::from("nvidia-smi"),
        }
    }

    /// Report usage of the filesystem holding `path` instead of `/`.
    pub fn with_disk_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.disk_path = path.into();
        self
    }

    pub fn with_nvidia_smi(mut self, program: impl Into<PathBuf>) -> Self {
        self.nvidia_smi = program.into();
        self
    }
}

impl Default for PlatformMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for PlatformMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlatformMetrics")
            .field("disk_path", &self.disk_path)
            .field("nvidia_smi", &self.nvidia_smi)
            .finish()
    }
}

impl SystemMetricsSource for PlatformMetrics {
    fn cpu_percent(&self) -> Result<f64, SampleError> {
        let mut system = self.system.lock();
        system.refresh_cpu();
        if system.cpus().is_empty() {
            return Err(MetricSection::Cpu.unavailable("no cpus reported"));
        }
        Ok(f64::from(system.global_cpu_info().cpu_usage()).clamp(0.0, 100.0))
    }

    fn memory_percent(&self) -> Result<f64, SampleError> {
        let mut system = self.system.lock();
        system.refresh_memory();
        let total = system.total_memory();
        if total == 0 {
            return Err(MetricSection::Memory.unavailable("total memory reported as zero"));
        }
        Ok(system.used_memory() as f64 / total as f64 * 100.0)
    }

    fn disk_percent(&self) -> Result<f64, SampleError> {
        let disks = Disks::new_with_refreshed_list();
        let disk = disks
            .list()
            .iter()
            .filter(|d| self.disk_path.starts_with(d.mount_point()))
            .max_by_key(|d| d.mount_point().as_os_str().len())
            .ok_or_else(|| {
                MetricSection::Disk.unavailable(format!(
                    "no mounted filesystem holds {}",
                    self.disk_path.display()
                ))
            })?;
        let total = disk.total_space();
        if total == 0 {
            return Err(MetricSection::Disk.unavailable("filesystem reports zero size"));
        }
        let used = total.saturating_sub(disk.available_space());
        Ok(used as f64 / total as f64 * 100.0)
    }

    fn gpu_samples(&self) -> Result<Vec<GpuSample>, SampleError> {
        query_nvidia_smi(&self.nvidia_smi)
    }

    fn process(&self) -> Result<Option<ProcessSample>, SampleError> {
        let pid = sysinfo::get_current_pid().map_err(|err| MetricSection::Process.unavailable(err))?;
        let mut system = self.system.lock();
        system.refresh_memory();
        if !system.refresh_process(pid) {
            return Err(MetricSection::Process.unavailable(format!("process {pid} not found")));
        }
        let total = system.total_memory();
        let process = system
            .process(pid)
            .ok_or_else(|| MetricSection::Process.unavailable(format!("process {pid} not found")))?;
        let rss = process.memory();
        Ok(Some(ProcessSample {
            pid: pid.as_u32(),
            cpu_percent: f64::from(process.cpu_usage()),
            memory_percent: if total > 0 {
                rss as f64 / total as f64 * 100.0
            } else {
                0.0
            },
            memory_rss_mb: rss as f64 / (1024.0 * 1024.0),
            num_threads: process.tasks().map(|tasks| tasks.len()),
        }))
    }
}

fn query_nvidia_smi(program: &Path) -> Result<Vec<GpuSample>, SampleError> {
    let output = Command::new(program)
        .args([
            "--query-gpu=index,memory.used,memory.total",
            "--format=csv,noheader,nounits",
        ])
        .output()
        .map_err(|err| MetricSection::Gpu.unavailable(format!("{}: {err}", program.display())))?;
    if !output.status.success() {
        return Err(MetricSection::Gpu.unavailable(format!(
            "{} exited with {}",
            program.display(),
            output.status
        )));
    }
    parse_nvidia_smi(&String::from_utf8_lossy(&output.stdout))
}

/// Parse `index, memory.used, memory.total` CSV rows (MiB, no header).
pub fn parse_nvidia_smi(stdout: &str) -> Result<Vec<GpuSample>, SampleError> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| {
            let fields: Vec<&str> = line.split(',').map(str::trim).collect();
            let bad = || MetricSection::Gpu.unavailable(format!("unparseable nvidia-smi row: {line}"));
            if fields.len() != 3 {
                return Err(bad());
            }
            let id = fields[0].parse::<u32>().map_err(|_| bad())?;
            let used = fields[1].parse::<f64>().map_err(|_| bad())?;
            let total = fields[2].parse::<f64>().map_err(|_| bad())?;
            Ok(GpuSample::new(id, used, total))
        })
        .collect()
}
