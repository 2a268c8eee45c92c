//! CLI commands implementation

use anyhow::{bail, Result};
use gpubal_core::{AdmissionState, BalanceConfig, DeviceId, ProcessRecord};
use gpubal_daemon::pidfile::{is_running, read_pid, send_signal};
use gpubal_scheduler::{
    AllocationMode, AllocationRequest, Constraints, DeviceCount, DeviceView, TaskScheduler,
};
use gpubal_store::StateStore;
use gpubal_telemetry::TelemetrySource;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Store connection and scheduler shared by the commands
pub struct Context {
    store: Arc<dyn StateStore>,
    scheduler: TaskScheduler,
}

impl Context {
    pub fn new(store: Arc<dyn StateStore>, config: BalanceConfig) -> Self {
        Self {
            scheduler: TaskScheduler::new(Arc::clone(&store), config),
            store,
        }
    }

    /// Enumerate local devices with `source` when the store is down
    pub fn with_detector(mut self, source: Arc<dyn TelemetrySource>) -> Self {
        self.scheduler = self.scheduler.with_detector(source);
        self
    }
}

/// Comma separated, as expected by CUDA_VISIBLE_DEVICES
pub fn format_devices(devices: &[DeviceId]) -> String {
    devices
        .iter()
        .map(|d| d.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

fn hint_label(device: &DeviceView) -> &'static str {
    if device.paused {
        "paused"
    } else if device.preferred {
        "preferred"
    } else if !device.fresh {
        "stale"
    } else {
        "-"
    }
}

/// Allocate devices for a job
pub async fn allocate(
    ctx: &Context,
    task_type: String,
    count: i64,
    constraints: Constraints,
    json: bool,
) -> Result<()> {
    let count = DeviceCount::try_from(count)?;
    let request = AllocationRequest::new(task_type, count).with_constraints(constraints);
    let allocation = ctx.scheduler.allocate(&request).await;

    if json {
        println!("{}", serde_json::to_string_pretty(&allocation)?);
        return Ok(());
    }

    match allocation.mode {
        AllocationMode::Degraded => {
            eprintln!("warning: state store unavailable, using static device list")
        }
        AllocationMode::Static => eprintln!("note: GPU balancing disabled"),
        AllocationMode::Balanced => {}
    }
    if allocation.is_empty() {
        eprintln!("No device has capacity for '{}'", request.task_type);
    }
    println!("{}", format_devices(&allocation.devices));
    Ok(())
}

/// Show fleet status
pub async fn status(ctx: &Context, json: bool) -> Result<()> {
    let view = ctx.scheduler.fleet_view().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&view)?);
        return Ok(());
    }

    match &view.daemon {
        Some(daemon) => {
            println!(
                "Balance daemon: {} (strategy {}, {} cycles, pid {})",
                daemon.state, daemon.strategy, daemon.cycles, daemon.pid
            );
            if let Some(ts) = daemon.last_run_ts {
                println!("  Last run: {} - {}", ts.to_rfc3339(), daemon.last_action);
            }
        }
        None => println!("Balance daemon: not running"),
    }

    if view.devices.is_empty() {
        println!("No device telemetry");
        return Ok(());
    }

    println!();
    println!(
        "{:<4} {:<28} {:>6} {:>12} {:>6} {:>6} {:<10}",
        "ID", "NAME", "UTIL%", "FREE MB", "TEMP", "PROCS", "HINT"
    );
    println!("{}", "-".repeat(80));
    for device in &view.devices {
        let s = &device.snapshot;
        println!(
            "{:<4} {:<28} {:>6.1} {:>12} {:>6} {:>6} {:<10}",
            s.device_id,
            s.name,
            s.util_pct,
            s.free_mem_mb(),
            s.temp_c,
            device.processes,
            hint_label(device)
        );
    }

    println!();
    if let Some(avg) = view.average_util() {
        println!("Average utilization: {:.1}%", avg);
    }
    println!("Total free memory: {} MB", view.total_free_mem_mb());
    if let Some(migration) = &view.last_migration {
        println!(
            "Last migration request: pid {} from {} to {} at {}",
            migration.pid,
            migration.source,
            migration.target,
            migration.requested_at.to_rfc3339()
        );
    }

    Ok(())
}

/// Remove all admission hints
pub async fn clear_hints(ctx: &Context) -> Result<()> {
    ctx.store
        .replace_admission(&AdmissionState::default())
        .await?;
    println!("Admission hints cleared");
    Ok(())
}

/// Stop the daemon named by a PID marker
pub async fn stop(pid_file: &Path, force: bool, timeout_secs: u64) -> Result<()> {
    let Some(pid) = read_pid(pid_file)? else {
        bail!("no pid file at {}; is gpubald running?", pid_file.display());
    };
    if !is_running(pid) {
        println!("gpubald (pid {}) is not running", pid);
        return Ok(());
    }

    let signal = if force { "KILL" } else { "TERM" };
    send_signal(pid, signal)?;
    println!("Sent SIG{} to gpubald (pid {})", signal, pid);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(timeout_secs);
    while is_running(pid) {
        if tokio::time::Instant::now() >= deadline {
            bail!(
                "gpubald (pid {}) still running after {}s; retry with --force",
                pid,
                timeout_secs
            );
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    if force {
        // A killed daemon cannot remove its own marker
        let _ = std::fs::remove_file(pid_file);
    }
    println!("gpubald stopped");
    Ok(())
}

/// Register a launched process
pub async fn register(ctx: &Context, pid: u32, device: DeviceId, task_type: String) -> Result<()> {
    let record = ProcessRecord::new(pid, device, task_type);
    ctx.scheduler.register_process(&record).await?;
    println!("Registered pid {} on device {}", pid, device);
    Ok(())
}

/// Refresh the heartbeat of a running process
pub async fn heartbeat(ctx: &Context, pid: u32, device: DeviceId) -> Result<()> {
    if !ctx.scheduler.heartbeat_process(device, pid).await? {
        bail!("pid {} is not registered on device {}", pid, device);
    }
    Ok(())
}

/// Unregister a finished process
pub async fn unregister(ctx: &Context, pid: u32, device: DeviceId) -> Result<()> {
    if ctx.scheduler.unregister_process(device, pid).await? {
        println!("Unregistered pid {} from device {}", pid, device);
    } else {
        println!("pid {} was not registered on device {}", pid, device);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use gpubal_store::MemoryStore;

    fn context() -> (Arc<MemoryStore>, Context) {
        let store = Arc::new(MemoryStore::new());
        let config = BalanceConfig {
            enabled: true,
            ..BalanceConfig::default()
        };
        (store.clone(), Context::new(store, config))
    }

    #[test]
    fn test_format_devices() {
        assert_eq!(format_devices(&[2, 0, 3]), "2,0,3");
        assert_eq!(format_devices(&[]), "");
    }

    #[tokio::test]
    async fn test_clear_hints() {
        let (store, ctx) = context();
        store
            .replace_admission(&AdmissionState::new([1].into(), [2].into()))
            .await
            .unwrap();
        clear_hints(&ctx).await.unwrap();
        assert!(store.get_admission().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_register_and_unregister() {
        let (_, ctx) = context();
        register(&ctx, 321, 1, "train".to_string()).await.unwrap();
        assert_eq!(ctx.scheduler.processes(1).await.unwrap().len(), 1);
        heartbeat(&ctx, 321, 1).await.unwrap();
        assert!(heartbeat(&ctx, 321, 2).await.is_err());
        unregister(&ctx, 321, 1).await.unwrap();
        assert!(ctx.scheduler.processes(1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_allocate_rejects_bad_count() {
        let (_, ctx) = context();
        assert!(allocate(&ctx, "train".to_string(), -4, Constraints::default(), false)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_stop_without_pid_file() {
        let path = std::env::temp_dir().join("gpubal-test-missing.pid");
        assert!(stop(&path, false, 1).await.is_err());
    }
}
