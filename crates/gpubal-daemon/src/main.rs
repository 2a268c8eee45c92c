//! gpubal daemon
//!
//! Runs the metrics collector, the balance daemon, or both, until SIGTERM or
//! SIGINT.

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use gpubal_balancer::BalanceDaemon;
use gpubal_core::BalanceConfig;
use gpubal_daemon::signal::shutdown_signal;
use gpubal_daemon::{init_logging, LogFormat, PidFile};
use gpubal_store::{MemoryStore, RedisStore, StateStore};
use gpubal_telemetry::{MetricsCollector, NvidiaSmiSource, TelemetrySource};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Role {
    Collector,
    Balancer,
    All,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum StoreKind {
    Redis,
    /// In-process store, only useful with `all`
    Memory,
}

/// gpubald - GPU telemetry collector and balance daemon
#[derive(Parser, Debug)]
#[command(name = "gpubald")]
#[command(version, about, long_about = None)]
struct Args {
    /// Which loops to run
    #[arg(value_enum, default_value = "all")]
    role: Role,

    /// TOML configuration file (environment variables take precedence)
    #[arg(long, env = "GPUBAL_CONFIG")]
    config: Option<PathBuf>,

    /// PID marker path
    #[arg(long, env = "GPUBAL_PID_FILE", default_value = "/tmp/gpubald.pid")]
    pid_file: PathBuf,

    /// Append logs to this file instead of stderr
    #[arg(long, env = "GPUBAL_LOG_FILE")]
    log_file: Option<PathBuf>,

    /// Override LOG_LEVEL
    #[arg(long)]
    log_level: Option<String>,

    /// Shared state backend
    #[arg(long, value_enum, default_value = "redis")]
    store: StoreKind,

    /// nvidia-smi executable
    #[arg(long, default_value = "nvidia-smi")]
    nvidia_smi: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = BalanceConfig::load(args.config.as_deref()).context("loading configuration")?;
    let level = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.logging.level.clone());
    let format: LogFormat = config.logging.format.parse()?;
    init_logging(&level, format, args.log_file.as_deref())?;

    info!("Starting gpubald v{}", env!("CARGO_PKG_VERSION"));

    let store: Arc<dyn StateStore> = match args.store {
        StoreKind::Redis => Arc::new(RedisStore::new(&config.store)?),
        StoreKind::Memory => {
            if args.role != Role::All {
                warn!("Memory store is process-local; other gpubal processes will not see it");
            }
            Arc::new(MemoryStore::new())
        }
    };

    let runs_collector = matches!(args.role, Role::Collector | Role::All);
    let runs_balancer = matches!(args.role, Role::Balancer | Role::All);

    if runs_balancer && !config.enabled && !runs_collector {
        bail!("GPU_BALANCING_ENABLED is false; nothing to run for role 'balancer'");
    }

    let pid_file = PidFile::create(&args.pid_file)?;
    info!(
        pid = std::process::id(),
        pid_file = %pid_file.path().display(),
        role = ?args.role,
        store = store.name(),
        "Daemon started"
    );

    let collector = runs_collector.then(|| {
        let source: Arc<dyn TelemetrySource> = Arc::new(NvidiaSmiSource::new(args.nvidia_smi.clone()));
        MetricsCollector::new(source, Arc::clone(&store), (&config).into()).start()
    });

    let balancer = if runs_balancer && config.enabled {
        Some(BalanceDaemon::new(Arc::clone(&store), config.clone()).start())
    } else {
        if runs_balancer {
            info!("GPU balancing disabled, balance daemon not started");
        }
        None
    };

    shutdown_signal().await;
    info!(grace = ?config.shutdown_grace, "Shutting down");

    if let Some(handle) = balancer {
        let status = handle.stop(config.shutdown_grace).await;
        info!(cycles = status.cycles, last_action = %status.last_action, "Balance daemon stopped");
    }
    if let Some(handle) = collector {
        if !handle.stop(config.shutdown_grace).await {
            warn!("Collector aborted after grace period");
        }
    }

    drop(pid_file);
    info!("gpubald exited");
    Ok(())
}
