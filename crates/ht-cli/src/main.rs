//! `ht-search`: run a hyperparameter search with the resource monitor
//! watching alongside.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use signal_hook::consts::{SIGINT, SIGTERM};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use ht_monitor::{log_warnings, MonitorConfig, ResourceMonitor, Thresholds};
use ht_optimizer::{CancelFlag, MonitorSettings, OptimizerConfig, Study, StudySummary, ThresholdOverrides};

mod command;

use command::CommandScorer;

const MONITOR_FILE: &str = "monitoring_data.json";

#[derive(Debug, Parser)]
#[command(name = "ht-search", version, about = "Hyperparameter search with a resource guard")]
struct Args {
    /// Number of trials to run; overrides `n_trials` in the config.
    #[arg(short = 'n', long, env = "HT_TRIALS")]
    trials: Option<usize>,

    /// Optimizer config file (YAML or JSON).
    #[arg(short, long, default_value = "config/optuna_config.yaml")]
    config: PathBuf,

    /// Output directory; overrides `output_dir` in the config.
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Do not run the resource monitor.
    #[arg(long)]
    no_monitor: bool,
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn apply_overrides(mut thresholds: Thresholds, overrides: &ThresholdOverrides) -> Thresholds {
    if let Some(v) = overrides.cpu_percent {
        thresholds.cpu_percent = v;
    }
    if let Some(v) = overrides.memory_percent {
        thresholds.memory_percent = v;
    }
    if let Some(v) = overrides.disk_percent {
        thresholds.disk_percent = v;
    }
    if let Some(v) = overrides.gpu_memory_percent {
        thresholds.gpu_memory_percent = v;
    }
    thresholds
}

fn start_monitor(settings: &MonitorSettings) -> Result<ResourceMonitor> {
    let config = MonitorConfig::default()
        .with_thresholds(apply_overrides(Thresholds::default(), &settings.thresholds))
        .with_history_cap(settings.history_cap)
        .with_join_timeout(Duration::from_secs_f64(settings.join_timeout_secs));
    let monitor = ResourceMonitor::new(config)?;

    if settings.adapt_to_platform {
        let platform = monitor.adapt_to_platform()?;
        info!(%platform, "detected platform");
    }
    monitor.add_callback(log_warnings);
    monitor.start(Duration::from_secs_f64(settings.interval_secs))?;
    Ok(monitor)
}

fn finish_monitor(monitor: ResourceMonitor, output_dir: &std::path::Path) {
    if !monitor.stop() {
        warn!("resource monitor did not stop cleanly");
    }
    if let Some(summary) = monitor.summary(chrono::Duration::hours(24)) {
        info!(
            data_points = summary.data_points,
            cpu_max = summary.cpu.map(|s| s.max),
            memory_max = summary.memory.map(|s| s.max),
            warnings = ?summary.warnings,
            "resource summary"
        );
    }
    let path = output_dir.join(MONITOR_FILE);
    if let Err(err) = monitor.save(&path) {
        error!(path = %path.display(), error = %err, "failed to save monitoring data");
    }
}

fn run(args: &Args) -> Result<StudySummary> {
    let mut config = OptimizerConfig::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    if let Some(n) = args.trials {
        config.n_trials = n;
    }
    if let Some(dir) = &args.output {
        config.output_dir = dir.clone();
    }
    let scorer_settings = config
        .scorer
        .clone()
        .ok_or_else(|| anyhow!("{} has no `scorer` section", args.config.display()))?;

    let mut study = Study::from_config(&config)?;
    let cancel = CancelFlag::new();
    for signal in [SIGINT, SIGTERM] {
        signal_hook::flag::register(signal, cancel.as_atomic())
            .with_context(|| format!("registering handler for signal {signal}"))?;
    }

    let monitor = if config.monitor.enabled && !args.no_monitor {
        Some(start_monitor(&config.monitor)?)
    } else {
        None
    };

    info!(
        config = %args.config.display(),
        output = %config.output_dir.display(),
        trials = config.n_trials,
        "starting search"
    );
    let mut scorer = CommandScorer::new(&scorer_settings);
    let outcome = study.optimize(config.n_trials, &mut scorer, Some(&cancel));

    if let Some(monitor) = monitor {
        finish_monitor(monitor, &config.output_dir);
    }
    Ok(outcome?)
}

fn main() -> ExitCode {
    init_logging();
    let args = Args::parse();

    match run(&args) {
        Ok(summary) => {
            println!("{summary}");
            if summary.cancelled {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            }
        }
        Err(err) => {
            error!(error = %format!("{err:#}"), "search failed");
            ExitCode::FAILURE
        }
    }
}
