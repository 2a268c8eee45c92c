//! gpubal CLI
//!
//! Command-line interface for launchers and operators: allocate devices,
//! inspect fleet state, manage the process registry and stop the daemon.

mod commands;

use clap::{Parser, Subcommand};
use gpubal_core::BalanceConfig;
use gpubal_daemon::{init_logging, LogFormat};
use gpubal_scheduler::Constraints;
use gpubal_store::{RedisStore, StateStore};
use gpubal_telemetry::NvidiaSmiSource;
use std::path::PathBuf;
use std::sync::Arc;

/// gpubal - GPU fleet admission control
#[derive(Parser, Debug)]
#[command(name = "gpubal")]
#[command(version, about, long_about = None)]
struct Cli {
    /// TOML configuration file (environment variables take precedence)
    #[arg(long, env = "GPUBAL_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print devices for a new job as a comma separated list
    Allocate {
        /// Job kind, e.g. train or selfplay
        task_type: String,

        /// Number of devices; -1 for every candidate
        #[arg(long, default_value_t = 1, allow_negative_numbers = true)]
        count: i64,

        /// Require at least this much free memory (MB)
        #[arg(long)]
        min_free_mem: Option<u64>,

        /// Require utilization at or below this percentage
        #[arg(long)]
        max_util: Option<f64>,

        /// Rank this device first if it qualifies
        #[arg(long)]
        prefer: Option<u32>,

        /// Print the full allocation as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show device telemetry, admission hints and daemon status
    Status {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Remove every paused / preferred hint
    ClearHints,

    /// Stop a running gpubald
    Stop {
        /// PID marker written by gpubald
        #[arg(long, env = "GPUBAL_PID_FILE", default_value = "/tmp/gpubald.pid")]
        pid_file: PathBuf,

        /// Send SIGKILL instead of SIGTERM
        #[arg(long)]
        force: bool,

        /// Seconds to wait for the daemon to exit
        #[arg(long, default_value_t = 35)]
        timeout: u64,
    },

    /// Record a launched process against a device
    Register {
        #[arg(long)]
        pid: u32,

        #[arg(long)]
        device: u32,

        #[arg(long, default_value = "default")]
        task_type: String,
    },

    /// Report that a registered process is still alive
    Heartbeat {
        #[arg(long)]
        pid: u32,

        #[arg(long)]
        device: u32,
    },

    /// Forget a finished process
    Unregister {
        #[arg(long)]
        pid: u32,

        #[arg(long)]
        device: u32,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "warn" };
    init_logging(level, LogFormat::Text, None)?;

    let context = || -> anyhow::Result<commands::Context> {
        let config = BalanceConfig::load(cli.config.as_deref())?;
        let store: Arc<dyn StateStore> = Arc::new(RedisStore::new(&config.store)?);
        Ok(commands::Context::new(store, config)
            .with_detector(Arc::new(NvidiaSmiSource::default())))
    };

    match cli.command {
        Commands::Allocate {
            task_type,
            count,
            min_free_mem,
            max_util,
            prefer,
            json,
        } => {
            let constraints = Constraints {
                min_free_mem_mb: min_free_mem,
                max_util_pct: max_util,
                preferred_device: prefer,
            };
            commands::allocate(&context()?, task_type, count, constraints, json).await?;
        }
        Commands::Status { json } => {
            commands::status(&context()?, json).await?;
        }
        Commands::ClearHints => {
            commands::clear_hints(&context()?).await?;
        }
        Commands::Stop {
            pid_file,
            force,
            timeout,
        } => {
            commands::stop(&pid_file, force, timeout).await?;
        }
        Commands::Register {
            pid,
            device,
            task_type,
        } => {
            commands::register(&context()?, pid, device, task_type).await?;
        }
        Commands::Heartbeat { pid, device } => {
            commands::heartbeat(&context()?, pid, device).await?;
        }
        Commands::Unregister { pid, device } => {
            commands::unregister(&context()?, pid, device).await?;
        }
    }

    Ok(())
}
