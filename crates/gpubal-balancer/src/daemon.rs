//! Balance daemon
//!
//! A periodic control loop: `idle -> checking -> acting -> idle`, with
//! `stopped` reachable from any state. Each cycle classifies every device with
//! fresh telemetry and rewrites the admission hints in one atomic store call.

use chrono::Utc;
use gpubal_core::{
    oldest_process, AdmissionState, BalanceConfig, BalanceResult, BalanceStrategy, DaemonState,
    DaemonStatus, DeviceId, MetricsSnapshot, MigrationRequest, ProcessRecord,
};
use gpubal_store::{keys, ProcessRegistry, StateStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::classify::{DeviceClass, FleetAssessment};
use crate::hysteresis::HysteresisTracker;
use crate::threshold::ThresholdEstimator;

/// Result of one balance cycle
#[derive(Debug, Clone)]
pub struct CycleOutcome {
    pub assessment: FleetAssessment,
    /// Hints in effect after the cycle
    pub admission: AdmissionState,
    /// Whether the hints were rewritten
    pub changed: bool,
    pub imbalanced: bool,
    pub migration: Option<MigrationRequest>,
    pub action: String,
}

pub struct BalanceDaemon {
    store: Arc<dyn StateStore>,
    registry: ProcessRegistry,
    config: BalanceConfig,
    estimator: ThresholdEstimator,
    hysteresis: HysteresisTracker,
    status: DaemonStatus,
    status_tx: watch::Sender<DaemonStatus>,
}

impl BalanceDaemon {
    pub fn new(store: Arc<dyn StateStore>, config: BalanceConfig) -> Self {
        let status = DaemonStatus::new(config.strategy);
        let (status_tx, _) = watch::channel(status.clone());
        Self {
            registry: ProcessRegistry::new(Arc::clone(&store)),
            estimator: ThresholdEstimator::new(&config.thresholds, config.history_len),
            hysteresis: HysteresisTracker::default(),
            store,
            config,
            status,
            status_tx,
        }
    }

    pub fn status(&self) -> &DaemonStatus {
        &self.status
    }

    fn set_state(&mut self, state: DaemonState) {
        self.status.state = state;
        self.status_tx.send_replace(self.status.clone());
    }

    async fn publish_status(&self) {
        if let Err(e) = self
            .store
            .put_hash(keys::DAEMON_STATUS, &self.status.to_fields())
            .await
        {
            warn!(error = %e, "Failed to publish daemon status");
        }
    }

    /// Run one full cycle and publish the resulting status.
    ///
    /// A store failure before the hint write aborts the cycle with hints,
    /// streaks and samples untouched.
    pub async fn run_cycle(&mut self) -> BalanceResult<CycleOutcome> {
        self.set_state(DaemonState::Checking);
        let result = self.evaluate().await;

        self.status.last_run_ts = Some(Utc::now());
        match &result {
            Ok(outcome) => {
                self.status.cycles += 1;
                self.status.last_action = outcome.action.clone();
            }
            Err(e) => {
                warn!(error = %e, "Balance cycle aborted, keeping previous hints");
                self.status.last_action = format!("degraded: {}", e);
            }
        }
        self.set_state(DaemonState::Idle);
        self.publish_status().await;
        result
    }

    async fn evaluate(&mut self) -> BalanceResult<CycleOutcome> {
        let snapshots = self.store.get_all_snapshots().await?;
        let current = self.store.get_admission().await?;

        // Trackers are committed only once the hint write has succeeded
        let mut estimator = self.estimator.clone();
        let mut hysteresis = self.hysteresis.clone();

        let now = Utc::now();
        let fresh: Vec<&MetricsSnapshot> = snapshots
            .values()
            .filter(|s| s.is_fresh(now, self.config.metrics_ttl))
            .collect();
        for snapshot in &fresh {
            estimator.record(snapshot.device_id, snapshot.util_pct);
        }

        let assessment = FleetAssessment::assess(
            fresh.iter().copied(),
            &self.config.thresholds,
            |id| estimator.band(id),
        );
        let imbalanced = assessment.is_imbalanced();
        debug!(
            devices = assessment.devices.len(),
            overloaded = ?assessment.overloaded(),
            underloaded = ?assessment.underloaded(),
            imbalanced,
            "Classified fleet"
        );

        let planned = if imbalanced && self.config.migration_enabled() {
            self.plan_migration(&assessment).await?
        } else {
            None
        };

        self.set_state(DaemonState::Acting);
        let next = next_admission(&mut hysteresis, &current, &assessment, imbalanced);
        let changed = next != current;
        if changed {
            self.store.replace_admission(&next).await?;
            info!(
                paused = ?next.paused,
                preferred = ?next.preferred,
                "Updated admission hints"
            );
        }
        self.estimator = estimator;
        self.hysteresis = hysteresis;

        let migration = match planned {
            Some(request) => self.publish_migration(request).await,
            None => None,
        };
        self.prune_processes(snapshots.keys().copied()).await;

        let mut action = if changed {
            format!("hints updated: paused={:?} preferred={:?}", next.paused, next.preferred)
        } else if imbalanced {
            "imbalance: hints unchanged".to_string()
        } else {
            "balanced".to_string()
        };
        if let Some(request) = &migration {
            action.push_str(&format!(
                "; migration requested for pid {} ({} -> {})",
                request.pid, request.source, request.target
            ));
        }

        Ok(CycleOutcome {
            assessment,
            admission: next,
            changed,
            imbalanced,
            migration,
            action,
        })
    }

    /// Pick the longest-running live process on the most overloaded device
    async fn plan_migration(
        &self,
        assessment: &FleetAssessment,
    ) -> BalanceResult<Option<MigrationRequest>> {
        let (Some(source), Some(target)) = (assessment.most_overloaded(), assessment.least_loaded())
        else {
            return Ok(None);
        };

        let now = Utc::now();
        let live: Vec<ProcessRecord> = self
            .registry
            .list(source)
            .await?
            .into_iter()
            .filter(|r| r.is_alive(now, self.config.heartbeat_timeout))
            .collect();
        let Some(victim) = oldest_process(&live) else {
            info!(device = source, "No live registered process to migrate");
            return Ok(None);
        };

        debug!(pid = victim.pid, task_type = %victim.task_type, "Selected migration candidate");
        Ok(Some(MigrationRequest::new(victim.pid, source, target)))
    }

    /// Write a migration request; a failure is logged and leaves the cycle intact
    async fn publish_migration(&self, request: MigrationRequest) -> Option<MigrationRequest> {
        match self
            .store
            .put_hash(keys::MIGRATION_REQUEST, &request.to_fields())
            .await
        {
            Ok(()) => {
                info!(
                    request_id = %request.request_id,
                    pid = request.pid,
                    source = request.source,
                    target = request.target,
                    "Requested process migration"
                );
                Some(request)
            }
            Err(e) => {
                warn!(pid = request.pid, error = %e, "Failed to write migration request");
                None
            }
        }
    }

    /// Drop registry entries whose heartbeat has expired
    async fn prune_processes(&self, devices: impl Iterator<Item = DeviceId>) {
        for device in devices {
            if let Err(e) = self
                .registry
                .prune_stale(device, self.config.heartbeat_timeout)
                .await
            {
                warn!(device, error = %e, "Failed to prune stale processes");
            }
        }
    }

    /// Run cycles on a fixed interval until `shutdown` fires.
    ///
    /// Shutdown is only observed between cycles, so an in-flight cycle always
    /// completes.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            strategy = %self.config.strategy,
            interval = ?self.config.balance_interval,
            adaptive = self.config.thresholds.adaptive,
            store = self.store.name(),
            "Balance daemon started"
        );
        if self.config.strategy == BalanceStrategy::ProcessMigration
            && !self.config.enable_migration
        {
            warn!("process_migration selected but ENABLE_MIGRATION is not set; migration requests are disabled");
        }
        self.publish_status().await;

        let mut ticker = tokio::time::interval(self.config.balance_interval);
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

            if let Ok(outcome) = self.run_cycle().await {
                debug!(action = %outcome.action, "Balance cycle complete");
            }
        }

        info!(cycles = self.status.cycles, "Balance daemon loop exited");
    }

    /// Spawn the loop and return a handle to it
    pub fn start(self) -> DaemonHandle {
        let (shutdown, rx) = watch::channel(false);
        let status = self.status_tx.subscribe();
        let store = Arc::clone(&self.store);
        let task = tokio::spawn(self.run(rx));
        DaemonHandle {
            shutdown,
            status,
            store,
            task,
        }
    }
}

/// Hints for the next cycle.
///
/// During an imbalance overloaded devices move to `paused` and underloaded
/// ones to `preferred`. A hinted device is released only after enough
/// consecutive nominal cycles. A paused device that is no longer overloaded
/// counts as nominal and can only leave `paused` through that release; it
/// becomes eligible for `preferred` on a later cycle. Devices without fresh
/// data keep their hints but lose their streak.
fn next_admission(
    hysteresis: &mut HysteresisTracker,
    current: &AdmissionState,
    assessment: &FleetAssessment,
    imbalanced: bool,
) -> AdmissionState {
    let mut next = current.clone();

    for (&id, device) in &assessment.devices {
        let held = current.is_paused(id);
        let settled = match device.class {
            DeviceClass::Underloaded if held => DeviceClass::Nominal,
            class => class,
        };
        let release = hysteresis.observe(id, settled);

        match device.class {
            DeviceClass::Overloaded if imbalanced => next.pause(id),
            DeviceClass::Overloaded => {
                next.preferred.remove(&id);
            }
            _ if held => {
                if release && next.release(id) {
                    debug!(device = id, "Released paused device");
                }
            }
            DeviceClass::Underloaded if imbalanced => next.prefer(id),
            _ if release => {
                if next.release(id) {
                    debug!(device = id, "Released admission hint");
                }
            }
            _ => {}
        }
    }

    for id in current.hinted() {
        if !assessment.devices.contains_key(&id) {
            hysteresis.reset(id);
        }
    }

    next.normalized()
}

/// Handle to a running balance daemon
pub struct DaemonHandle {
    shutdown: watch::Sender<bool>,
    status: watch::Receiver<DaemonStatus>,
    store: Arc<dyn StateStore>,
    task: JoinHandle<()>,
}

impl DaemonHandle {
    /// Latest in-process status
    pub fn status(&self) -> DaemonStatus {
        self.status.borrow().clone()
    }

    /// Stop the loop, waiting up to `grace` for the in-flight cycle.
    ///
    /// Afterwards the admission hints are cleared and a `stopped` status is
    /// flushed. Store errors during teardown are logged, not returned.
    pub async fn stop(mut self, grace: Duration) -> DaemonStatus {
        let _ = self.shutdown.send(true);
        if tokio::time::timeout(grace, &mut self.task).await.is_err() {
            warn!(grace = ?grace, "Balance cycle did not finish in time, aborting");
            self.task.abort();
        }

        let mut status = self.status.borrow().clone();
        status.state = DaemonState::Stopped;
        status.last_action = "stopped".to_string();

        match self
            .store
            .replace_admission(&AdmissionState::default())
            .await
        {
            Ok(()) => info!("Cleared admission hints"),
            Err(e) => warn!(error = %e, "Failed to clear admission hints"),
        }
        if let Err(e) = self
            .store
            .put_hash(keys::DAEMON_STATUS, &status.to_fields())
            .await
        {
            warn!(error = %e, "Failed to flush stopped status");
        }

        info!(cycles = status.cycles, "Balance daemon stopped");
        status
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use gpubal_core::{BalanceError, DeviceId, DeviceReading, ProcessRecord};
    use gpubal_store::MemoryStore;
    use std::collections::BTreeSet;

    const TTL: Duration = Duration::from_secs(15);

    fn config() -> BalanceConfig {
        BalanceConfig {
            enabled: true,
            ..BalanceConfig::default()
        }
    }

    fn snapshot(id: DeviceId, util: f64) -> MetricsSnapshot {
        MetricsSnapshot::from_reading(
            DeviceReading {
                device_id: id,
                name: format!("GPU {}", id),
                util_pct: util,
                mem_used_mb: 4000,
                mem_total_mb: 16000,
                temp_c: 60,
                process_count: 1,
            },
            Utc::now(),
        )
    }

    async fn publish(store: &MemoryStore, readings: &[(DeviceId, f64)]) {
        for (id, util) in readings {
            store.put_snapshot(&snapshot(*id, *util), TTL).await.unwrap();
        }
    }

    fn setup(config: BalanceConfig) -> (Arc<MemoryStore>, BalanceDaemon) {
        let store = Arc::new(MemoryStore::new());
        let daemon = BalanceDaemon::new(store.clone(), config);
        (store, daemon)
    }

    #[tokio::test]
    async fn test_imbalance_pauses_and_prefers() {
        let (store, mut daemon) = setup(config());
        publish(&store, &[(1, 95.0), (2, 40.0), (3, 70.0)]).await;

        let outcome = daemon.run_cycle().await.unwrap();
        assert!(outcome.imbalanced);
        assert!(outcome.changed);

        let admission = store.get_admission().await.unwrap();
        assert_eq!(admission.paused, BTreeSet::from([1]));
        assert_eq!(admission.preferred, BTreeSet::from([2]));

        let status =
            DaemonStatus::from_fields(&store.get_hash(keys::DAEMON_STATUS).await.unwrap())
                .unwrap();
        assert_eq!(status.state, DaemonState::Idle);
        assert_eq!(status.cycles, 1);
        assert!(status.last_action.starts_with("hints updated"));
    }

    #[tokio::test]
    async fn test_overload_without_receiver_is_not_actionable() {
        let (store, mut daemon) = setup(config());
        publish(&store, &[(1, 95.0), (3, 70.0)]).await;

        let outcome = daemon.run_cycle().await.unwrap();
        assert!(!outcome.imbalanced);
        assert!(!outcome.changed);
        assert!(store.get_admission().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_release_after_two_nominal_cycles() {
        let (store, mut daemon) = setup(config());
        publish(&store, &[(1, 95.0), (2, 40.0)]).await;
        daemon.run_cycle().await.unwrap();

        publish(&store, &[(1, 70.0), (2, 70.0)]).await;
        daemon.run_cycle().await.unwrap();
        let admission = store.get_admission().await.unwrap();
        assert_eq!(admission.paused, BTreeSet::from([1]));
        assert_eq!(admission.preferred, BTreeSet::from([2]));

        daemon.run_cycle().await.unwrap();
        assert!(store.get_admission().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_oscillating_device_stays_paused() {
        let (store, mut daemon) = setup(config());
        for cycle in 0..8 {
            let util = if cycle % 2 == 0 { 95.0 } else { 70.0 };
            publish(&store, &[(1, util), (2, 40.0)]).await;
            daemon.run_cycle().await.unwrap();
            assert!(
                store.get_admission().await.unwrap().is_paused(1),
                "released on cycle {}",
                cycle
            );
        }
    }

    #[tokio::test]
    async fn test_store_outage_keeps_hints() {
        let (store, mut daemon) = setup(config());
        publish(&store, &[(1, 95.0), (2, 40.0)]).await;
        daemon.run_cycle().await.unwrap();
        publish(&store, &[(1, 70.0), (2, 70.0)]).await;

        store.set_unavailable(true);
        for _ in 0..3 {
            let result = daemon.run_cycle().await;
            assert!(matches!(result, Err(BalanceError::StoreUnavailable(_))));
        }
        assert!(daemon.status().last_action.starts_with("degraded"));
        assert_eq!(daemon.status().cycles, 1);
        store.set_unavailable(false);

        let admission = store.get_admission().await.unwrap();
        assert_eq!(admission.paused, BTreeSet::from([1]));

        // Outage cycles do not count toward release
        daemon.run_cycle().await.unwrap();
        assert!(store.get_admission().await.unwrap().is_paused(1));
    }

    #[tokio::test]
    async fn test_stale_snapshot_ignored() {
        let (store, mut daemon) = setup(config());
        let mut stale = snapshot(1, 99.0);
        stale.timestamp -= chrono::Duration::seconds(60);
        store
            .put_snapshot(&stale, Duration::from_secs(600))
            .await
            .unwrap();
        publish(&store, &[(2, 40.0)]).await;

        let outcome = daemon.run_cycle().await.unwrap();
        assert_eq!(outcome.assessment.class_of(1), None);
        assert!(!outcome.imbalanced);
    }

    #[tokio::test]
    async fn test_migration_requires_explicit_enable() {
        let (store, mut daemon) = setup(BalanceConfig {
            strategy: BalanceStrategy::ProcessMigration,
            ..config()
        });
        ProcessRegistry::new(store.clone())
            .register(&ProcessRecord::new(501, 1, "selfplay"))
            .await
            .unwrap();
        publish(&store, &[(1, 95.0), (2, 40.0)]).await;

        let outcome = daemon.run_cycle().await.unwrap();
        assert!(outcome.migration.is_none());
        assert!(store
            .get_hash(keys::MIGRATION_REQUEST)
            .await
            .unwrap()
            .is_empty());
        assert_eq!(
            store.get_admission().await.unwrap().paused,
            BTreeSet::from([1])
        );
    }

    #[tokio::test]
    async fn test_migration_targets_oldest_process() {
        let (store, mut daemon) = setup(BalanceConfig {
            strategy: BalanceStrategy::ProcessMigration,
            enable_migration: true,
            ..config()
        });
        let registry = ProcessRegistry::new(store.clone());
        let mut old = ProcessRecord::new(700, 1, "train");
        old.started_at -= chrono::Duration::minutes(5);
        registry.register(&old).await.unwrap();
        registry
            .register(&ProcessRecord::new(701, 1, "selfplay"))
            .await
            .unwrap();
        publish(&store, &[(1, 95.0), (2, 40.0), (3, 30.0)]).await;

        let outcome = daemon.run_cycle().await.unwrap();
        let request = outcome.migration.unwrap();
        assert_eq!((request.pid, request.source), (700, 1));
        // Device 3 has the lower load score of the two receivers
        assert_eq!(request.target, 3);

        let stored =
            MigrationRequest::from_fields(&store.get_hash(keys::MIGRATION_REQUEST).await.unwrap())
                .unwrap();
        assert_eq!(stored.request_id, request.request_id);
    }

    #[tokio::test]
    async fn test_paused_device_is_not_preferred_until_released() {
        let (store, mut daemon) = setup(config());
        publish(&store, &[(1, 95.0), (2, 40.0)]).await;
        daemon.run_cycle().await.unwrap();

        // Load flips: device 1 drops to idle, device 2 saturates
        publish(&store, &[(1, 30.0), (2, 95.0)]).await;
        daemon.run_cycle().await.unwrap();
        let admission = store.get_admission().await.unwrap();
        assert_eq!(admission.paused, BTreeSet::from([1, 2]));
        assert!(admission.preferred.is_empty());

        daemon.run_cycle().await.unwrap();
        let admission = store.get_admission().await.unwrap();
        assert_eq!(admission.paused, BTreeSet::from([2]));
        assert!(!admission.is_preferred(1));

        daemon.run_cycle().await.unwrap();
        let admission = store.get_admission().await.unwrap();
        assert_eq!(admission.paused, BTreeSet::from([2]));
        assert_eq!(admission.preferred, BTreeSet::from([1]));
    }

    #[tokio::test]
    async fn test_failed_hint_write_does_not_advance_release() {
        let (store, mut daemon) = setup(config());
        publish(&store, &[(1, 95.0), (2, 40.0)]).await;
        daemon.run_cycle().await.unwrap();

        // Devices 3 and 4 would be hinted, but the write fails
        publish(&store, &[(1, 70.0), (2, 70.0), (3, 30.0), (4, 95.0)]).await;
        store.fail_writes_to(keys::DeviceSet::Paused.key());
        assert!(daemon.run_cycle().await.is_err());
        store.clear_write_failures();

        // The aborted cycle must not count as the first nominal one
        publish(&store, &[(1, 70.0), (2, 70.0), (3, 70.0), (4, 70.0)]).await;
        daemon.run_cycle().await.unwrap();
        let admission = store.get_admission().await.unwrap();
        assert_eq!(admission.paused, BTreeSet::from([1]));
        assert_eq!(admission.preferred, BTreeSet::from([2]));

        daemon.run_cycle().await.unwrap();
        assert!(store.get_admission().await.unwrap().is_empty());
        assert_eq!(daemon.status().cycles, 3);
    }

    #[tokio::test]
    async fn test_migration_write_failure_keeps_cycle() {
        let (store, mut daemon) = setup(BalanceConfig {
            strategy: BalanceStrategy::ProcessMigration,
            enable_migration: true,
            ..config()
        });
        ProcessRegistry::new(store.clone())
            .register(&ProcessRecord::new(610, 1, "train"))
            .await
            .unwrap();
        publish(&store, &[(1, 95.0), (2, 40.0)]).await;
        store.fail_writes_to(keys::MIGRATION_REQUEST);

        let outcome = daemon.run_cycle().await.unwrap();
        assert!(outcome.changed);
        assert!(outcome.migration.is_none());
        assert_eq!(daemon.status().cycles, 1);
        assert!(daemon.status().last_action.starts_with("hints updated"));
        assert!(store.get_admission().await.unwrap().is_paused(1));
    }

    #[tokio::test]
    async fn test_migration_skips_silent_processes() {
        let (store, mut daemon) = setup(BalanceConfig {
            strategy: BalanceStrategy::ProcessMigration,
            enable_migration: true,
            ..config()
        });
        let registry = ProcessRegistry::new(store.clone());
        let mut dead = ProcessRecord::new(800, 1, "selfplay");
        dead.started_at -= chrono::Duration::hours(1);
        dead.last_heartbeat -= chrono::Duration::minutes(10);
        registry.register(&dead).await.unwrap();
        let mut live = ProcessRecord::new(801, 1, "selfplay");
        live.started_at -= chrono::Duration::minutes(5);
        registry.register(&live).await.unwrap();
        publish(&store, &[(1, 95.0), (2, 40.0)]).await;

        let outcome = daemon.run_cycle().await.unwrap();
        assert_eq!(outcome.migration.map(|r| r.pid), Some(801));

        // The silent process is pruned from the registry by the same cycle
        let pids: Vec<u32> = registry.list(1).await.unwrap().iter().map(|r| r.pid).collect();
        assert_eq!(pids, vec![801]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_stop_clears_hints() {
        let (store, daemon) = setup(BalanceConfig {
            balance_interval: Duration::from_secs(10),
            ..config()
        });
        publish(&store, &[(1, 95.0), (2, 40.0)]).await;

        let handle = daemon.start();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(handle.status().cycles, 1);
        assert!(!store.get_admission().await.unwrap().is_empty());

        let status = handle.stop(Duration::from_secs(5)).await;
        assert_eq!(status.state, DaemonState::Stopped);
        assert!(store.get_admission().await.unwrap().is_empty());

        let published =
            DaemonStatus::from_fields(&store.get_hash(keys::DAEMON_STATUS).await.unwrap())
                .unwrap();
        assert_eq!(published.state, DaemonState::Stopped);
    }
}
