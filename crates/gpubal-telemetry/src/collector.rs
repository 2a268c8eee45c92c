//! Metrics collector
//!
//! Polls every device on a fixed interval and publishes one snapshot per
//! device into the state store. A device that fails or stalls is skipped for
//! the cycle; its previous snapshot simply ages out.

use chrono::Utc;
use gpubal_core::{BalanceConfig, BalanceError, BalanceResult, DeviceId, MetricsSnapshot};
use gpubal_store::{DeviceSet, StateStore};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::source::TelemetrySource;

/// Collector timing
#[derive(Debug, Clone, Copy)]
pub struct CollectorConfig {
    /// Time between cycles
    pub poll_interval: Duration,
    /// Lifetime of a published snapshot
    pub metrics_ttl: Duration,
    /// Budget for a single device read
    pub telemetry_timeout: Duration,
}

impl From<&BalanceConfig> for CollectorConfig {
    fn from(config: &BalanceConfig) -> Self {
        Self {
            poll_interval: config.poll_interval,
            metrics_ttl: config.metrics_ttl,
            telemetry_timeout: config.telemetry_timeout,
        }
    }
}

/// Outcome of one collection cycle
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CollectionReport {
    /// Devices whose snapshot was refreshed
    pub published: Vec<DeviceId>,
    /// Devices that failed or timed out
    pub skipped: Vec<DeviceId>,
    /// Devices with a live snapshot after the cycle
    pub available: BTreeSet<DeviceId>,
}

/// Periodic telemetry publisher
pub struct MetricsCollector {
    source: Arc<dyn TelemetrySource>,
    store: Arc<dyn StateStore>,
    config: CollectorConfig,
}

impl MetricsCollector {
    pub fn new(
        source: Arc<dyn TelemetrySource>,
        store: Arc<dyn StateStore>,
        config: CollectorConfig,
    ) -> Self {
        Self {
            source,
            store,
            config,
        }
    }

    /// Run a single collection cycle.
    ///
    /// Device reads run concurrently, one task per device, each under the
    /// telemetry timeout. Store failures abort the cycle.
    pub async fn collect_once(&self) -> BalanceResult<CollectionReport> {
        let ids = match tokio::time::timeout(
            self.config.telemetry_timeout,
            self.source.device_ids(),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => {
                return Err(BalanceError::Internal(format!(
                    "device enumeration timed out after {:?}",
                    self.config.telemetry_timeout
                )))
            }
        };

        let mut reads = JoinSet::new();
        for id in ids.iter().copied() {
            let source = Arc::clone(&self.source);
            let budget = self.config.telemetry_timeout;
            reads.spawn(async move {
                let result = match tokio::time::timeout(budget, source.read(id)).await {
                    Ok(result) => result,
                    Err(_) => Err(BalanceError::telemetry(
                        id,
                        format!("read timed out after {:?}", budget),
                    )),
                };
                (id, result)
            });
        }

        let mut report = CollectionReport::default();
        let mut snapshots = Vec::with_capacity(ids.len());
        let mut pending: BTreeSet<DeviceId> = ids.iter().copied().collect();
        while let Some(joined) = reads.join_next().await {
            match joined {
                Ok((id, Ok(reading))) => {
                    pending.remove(&id);
                    snapshots.push(MetricsSnapshot::from_reading(reading, Utc::now()))
                }
                Ok((id, Err(e))) => {
                    pending.remove(&id);
                    warn!(device = id, error = %e, "Skipping device this cycle");
                    report.skipped.push(id);
                }
                Err(e) => warn!(error = %e, "Telemetry task failed"),
            }
        }
        // Whatever never reported back belonged to a task that panicked
        for id in pending {
            warn!(device = id, "Skipping device after telemetry task failure");
            report.skipped.push(id);
        }

        for snapshot in &snapshots {
            self.store
                .put_snapshot(snapshot, self.config.metrics_ttl)
                .await?;
            report.published.push(snapshot.device_id);
        }
        report.published.sort_unstable();
        report.skipped.sort_unstable();

        let live = self.store.get_all_snapshots().await?;
        report.available = live.keys().copied().collect();
        self.store
            .set_replace(
                DeviceSet::Available,
                &report.available,
                Some(self.config.metrics_ttl),
            )
            .await?;

        log_summary(&snapshots);
        Ok(report)
    }

    /// Collect until `shutdown` flips to true or its sender is dropped
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            source = self.source.name(),
            store = self.store.name(),
            interval = ?self.config.poll_interval,
            ttl = ?self.config.metrics_ttl,
            "Metrics collector started"
        );

        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
                _ = ticker.tick() => {}
            }

            match self.collect_once().await {
                Ok(report) => debug!(
                    published = report.published.len(),
                    skipped = report.skipped.len(),
                    "Collection cycle complete"
                ),
                Err(e) => warn!(error = %e, "Collection cycle failed"),
            }
        }

        info!("Metrics collector stopped");
    }

    /// Spawn the collection loop
    pub fn start(self) -> CollectorHandle {
        let (shutdown, rx) = watch::channel(false);
        let task = tokio::spawn(self.run(rx));
        CollectorHandle { shutdown, task }
    }
}

fn log_summary(snapshots: &[MetricsSnapshot]) {
    if snapshots.is_empty() {
        return;
    }
    let avg_util =
        snapshots.iter().map(|s| s.util_pct).sum::<f64>() / snapshots.len() as f64;
    let free_mb: u64 = snapshots.iter().map(|s| s.free_mem_mb()).sum();
    let processes: u32 = snapshots.iter().map(|s| s.process_count).sum();
    info!(
        devices = snapshots.len(),
        avg_util = %format!("{:.1}", avg_util),
        free_mb,
        processes,
        "Fleet summary"
    );
}

/// Handle to a running collector
pub struct CollectorHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl CollectorHandle {
    /// Signal shutdown and wait up to `grace` for the in-flight cycle.
    ///
    /// Returns false if the loop had to be aborted.
    pub async fn stop(mut self, grace: Duration) -> bool {
        let _ = self.shutdown.send(true);
        match tokio::time::timeout(grace, &mut self.task).await {
            Ok(_) => true,
            Err(_) => {
                warn!(grace = ?grace, "Collector did not stop in time, aborting");
                self.task.abort();
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::static_source::StaticSource;
    use gpubal_core::DeviceReading;
    use gpubal_store::MemoryStore;

    fn reading(id: DeviceId, util: f64) -> DeviceReading {
        DeviceReading {
            device_id: id,
            name: format!("GPU {}", id),
            util_pct: util,
            mem_used_mb: 4000,
            mem_total_mb: 16000,
            temp_c: 55,
            process_count: 2,
        }
    }

    fn config() -> CollectorConfig {
        CollectorConfig {
            poll_interval: Duration::from_secs(5),
            metrics_ttl: Duration::from_secs(15),
            telemetry_timeout: Duration::from_secs(2),
        }
    }

    fn collector(source: Arc<StaticSource>, store: Arc<MemoryStore>) -> MetricsCollector {
        MetricsCollector::new(source, store, config())
    }

    #[tokio::test(start_paused = true)]
    async fn test_collect_publishes_all_devices() {
        let source = Arc::new(StaticSource::with_readings([
            reading(0, 20.0),
            reading(1, 140.0),
        ]));
        let store = Arc::new(MemoryStore::new());

        let report = collector(source, store.clone()).collect_once().await.unwrap();
        assert_eq!(report.published, vec![0, 1]);
        assert!(report.skipped.is_empty());

        let snapshots = store.get_all_snapshots().await.unwrap();
        assert_eq!(snapshots.len(), 2);
        // Out-of-range utilization is clamped before publishing
        assert_eq!(snapshots[&1].util_pct, 100.0);
        assert_eq!(
            store.set_members(DeviceSet::Available).await.unwrap(),
            BTreeSet::from([0, 1])
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_device_is_isolated() {
        let source = Arc::new(StaticSource::with_readings([
            reading(0, 20.0),
            reading(1, 30.0),
            reading(2, 40.0),
        ]));
        source.fail(1, "NVML_ERROR_GPU_IS_LOST").await;
        source.hang(2, Duration::from_secs(60)).await;
        let store = Arc::new(MemoryStore::new());

        let report = collector(source, store.clone()).collect_once().await.unwrap();
        assert_eq!(report.published, vec![0]);
        assert_eq!(report.skipped, vec![1, 2]);
        assert_eq!(report.available, BTreeSet::from([0]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicked_read_counts_as_skipped() {
        let source = Arc::new(StaticSource::with_readings([
            reading(0, 20.0),
            reading(3, 30.0),
        ]));
        source.crash(3).await;
        let store = Arc::new(MemoryStore::new());

        let report = collector(source, store).collect_once().await.unwrap();
        assert_eq!(report.published, vec![0]);
        assert_eq!(report.skipped, vec![3]);
        assert_eq!(report.available, BTreeSet::from([0]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_device_ages_out() {
        let source = Arc::new(StaticSource::with_readings([
            reading(0, 20.0),
            reading(1, 30.0),
        ]));
        let store = Arc::new(MemoryStore::new());
        let collector = collector(source.clone(), store.clone());

        collector.collect_once().await.unwrap();
        source.fail(1, "gone").await;

        // Still inside the TTL window
        tokio::time::advance(Duration::from_secs(5)).await;
        let report = collector.collect_once().await.unwrap();
        assert_eq!(report.available, BTreeSet::from([0, 1]));

        tokio::time::advance(Duration::from_secs(11)).await;
        let report = collector.collect_once().await.unwrap();
        assert_eq!(report.available, BTreeSet::from([0]));
    }

    #[tokio::test]
    async fn test_store_outage_fails_cycle() {
        let source = Arc::new(StaticSource::with_readings([reading(0, 20.0)]));
        let store = Arc::new(MemoryStore::new());
        store.set_unavailable(true);

        let result = collector(source, store).collect_once().await;
        assert!(matches!(
            result,
            Err(BalanceError::StoreUnavailable(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_publishes_and_stops() {
        let source = Arc::new(StaticSource::with_readings([reading(3, 50.0)]));
        let store = Arc::new(MemoryStore::new());
        let handle = collector(source, store.clone()).start();

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(store.get_all_snapshots().await.unwrap().contains_key(&3));

        assert!(handle.stop(Duration::from_secs(5)).await);
    }
}
