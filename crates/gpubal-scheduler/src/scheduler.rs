//! Task scheduler
//!
//! Answers "which devices should this job use" from the latest telemetry and
//! admission hints. Store and telemetry failures never reach callers: during
//! an outage the configured device list is used, then the devices seen on the
//! last successful read, then whatever the local telemetry source enumerates.

use chrono::Utc;
use gpubal_core::{
    BalanceConfig, BalanceResult, DaemonStatus, DeviceId, MigrationRequest, ProcessRecord,
};
use gpubal_store::{keys, DeviceSet, ProcessRegistry, StateStore};
use gpubal_telemetry::TelemetrySource;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::fleet::{DeviceView, FleetView};
use crate::ranking::{rank_candidates, Limits};
use crate::request::{Allocation, AllocationMode, AllocationRequest, DeviceCount};

/// Read-only allocator; safe to share between tasks
pub struct TaskScheduler {
    store: Arc<dyn StateStore>,
    registry: ProcessRegistry,
    config: BalanceConfig,
    /// Enumerates local devices when the store cannot
    detector: Option<Arc<dyn TelemetrySource>>,
    /// Devices seen on the last successful store read
    last_seen: RwLock<BTreeSet<DeviceId>>,
}

impl TaskScheduler {
    pub fn new(store: Arc<dyn StateStore>, config: BalanceConfig) -> Self {
        Self {
            registry: ProcessRegistry::new(Arc::clone(&store)),
            store,
            config,
            detector: None,
            last_seen: RwLock::new(BTreeSet::new()),
        }
    }

    /// Use `source` to enumerate devices during a store outage
    pub fn with_detector(mut self, source: Arc<dyn TelemetrySource>) -> Self {
        self.detector = Some(source);
        self
    }

    /// Pick devices for a job.
    ///
    /// The result may be shorter than requested, or empty when nothing has
    /// capacity.
    pub async fn allocate(&self, request: &AllocationRequest) -> Allocation {
        if !self.config.enabled {
            let devices = self.static_devices().await;
            return Allocation {
                devices: devices.into_iter().take(request.count.limit()).collect(),
                mode: AllocationMode::Static,
            };
        }

        match self.ranked(request).await {
            Ok(devices) => {
                if devices.is_empty() {
                    info!(task_type = %request.task_type, "No device has capacity");
                } else {
                    debug!(
                        task_type = %request.task_type,
                        count = %request.count,
                        devices = ?devices,
                        "Allocated devices"
                    );
                }
                Allocation {
                    devices,
                    mode: AllocationMode::Balanced,
                }
            }
            Err(e) => {
                warn!(
                    task_type = %request.task_type,
                    error = %e,
                    "Store unavailable, falling back to static device list"
                );
                Allocation {
                    devices: self
                        .fallback_devices()
                        .await
                        .into_iter()
                        .take(request.count.limit())
                        .collect(),
                    mode: AllocationMode::Degraded,
                }
            }
        }
    }

    /// Allocate with an integer count, where `-1` means all candidates.
    ///
    /// Other negative counts yield an empty list.
    pub async fn allocate_gpus(&self, task_type: &str, count: i64) -> Vec<DeviceId> {
        match DeviceCount::try_from(count) {
            Ok(count) => {
                self.allocate(&AllocationRequest::new(task_type, count))
                    .await
                    .devices
            }
            Err(e) => {
                warn!(task_type, error = %e, "Rejected allocation request");
                Vec::new()
            }
        }
    }

    async fn ranked(&self, request: &AllocationRequest) -> BalanceResult<Vec<DeviceId>> {
        // Two reads; the pair may be slightly inconsistent, which is tolerated
        let snapshots = self.store.get_all_snapshots().await?;
        let admission = self.store.get_admission().await?;
        self.remember(snapshots.keys().copied()).await;

        let limits = Limits::effective(&self.config.thresholds, &request.constraints);
        let ranked = rank_candidates(
            &snapshots,
            &admission,
            &limits,
            request.constraints.preferred_device,
            Utc::now(),
            self.config.metrics_ttl,
        );
        Ok(ranked.into_iter().take(request.count.limit()).collect())
    }

    /// Device list used when admission logic is off
    async fn static_devices(&self) -> Vec<DeviceId> {
        if !self.config.static_devices.is_empty() {
            return self.config.static_devices.clone();
        }
        match self.store.set_members(DeviceSet::Available).await {
            Ok(available) if !available.is_empty() => {
                self.remember(available.iter().copied()).await;
                return available.into_iter().collect();
            }
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "No static device list and store unavailable");
                return self.fallback_devices().await;
            }
        }
        match self.store.get_all_snapshots().await {
            Ok(snapshots) => {
                self.remember(snapshots.keys().copied()).await;
                snapshots.into_keys().collect()
            }
            Err(e) => {
                warn!(error = %e, "No static device list and store unavailable");
                self.fallback_devices().await
            }
        }
    }

    async fn remember(&self, ids: impl Iterator<Item = DeviceId>) {
        let ids: BTreeSet<DeviceId> = ids.collect();
        if !ids.is_empty() {
            *self.last_seen.write().await = ids;
        }
    }

    /// Full device list for when the store is unreachable
    async fn fallback_devices(&self) -> Vec<DeviceId> {
        if !self.config.static_devices.is_empty() {
            return self.config.static_devices.clone();
        }

        let last_seen = self.last_seen.read().await.clone();
        if !last_seen.is_empty() {
            debug!(devices = ?last_seen, "Using devices from the last successful read");
            return last_seen.into_iter().collect();
        }

        let Some(detector) = &self.detector else {
            warn!("No GPU_DEVICES, no previous read and no detector; nothing to fall back to");
            return Vec::new();
        };
        match tokio::time::timeout(self.config.telemetry_timeout, detector.device_ids()).await {
            Ok(Ok(mut ids)) => {
                ids.sort_unstable();
                ids.dedup();
                debug!(source = detector.name(), devices = ?ids, "Using detected devices");
                ids
            }
            Ok(Err(e)) => {
                warn!(source = detector.name(), error = %e, "Device detection failed");
                Vec::new()
            }
            Err(_) => {
                warn!(source = detector.name(), "Device detection timed out");
                Vec::new()
            }
        }
    }

    /// Record a launched process against its device
    pub async fn register_process(&self, record: &ProcessRecord) -> BalanceResult<()> {
        self.registry.register(record).await
    }

    /// Forget a finished process; returns whether it was registered
    pub async fn unregister_process(&self, device: DeviceId, pid: u32) -> BalanceResult<bool> {
        self.registry.unregister(device, pid).await
    }

    /// Refresh a process heartbeat; returns whether it was registered
    pub async fn heartbeat_process(&self, device: DeviceId, pid: u32) -> BalanceResult<bool> {
        self.registry.heartbeat(device, pid).await
    }

    pub async fn processes(&self, device: DeviceId) -> BalanceResult<Vec<ProcessRecord>> {
        self.registry.list(device).await
    }

    /// Snapshot of everything the store knows, for status reporting
    pub async fn fleet_view(&self) -> BalanceResult<FleetView> {
        let snapshots = self.store.get_all_snapshots().await?;
        let available = self.store.set_members(DeviceSet::Available).await?;
        let admission = self.store.get_admission().await?;

        let daemon = match self.store.get_hash(keys::DAEMON_STATUS).await? {
            fields if fields.is_empty() => None,
            fields => DaemonStatus::from_fields(&fields)
                .map_err(|e| warn!(error = %e, "Unreadable daemon status"))
                .ok(),
        };
        let last_migration = match self.store.get_hash(keys::MIGRATION_REQUEST).await? {
            fields if fields.is_empty() => None,
            fields => MigrationRequest::from_fields(&fields)
                .map_err(|e| warn!(error = %e, "Unreadable migration request"))
                .ok(),
        };

        let now = Utc::now();
        let mut devices = Vec::with_capacity(snapshots.len());
        for (id, snapshot) in snapshots {
            let processes = self.registry.list(id).await?.len();
            devices.push(DeviceView {
                fresh: snapshot.is_fresh(now, self.config.metrics_ttl),
                available: available.contains(&id),
                paused: admission.is_paused(id),
                preferred: admission.is_preferred(id),
                processes,
                snapshot,
            });
        }

        Ok(FleetView {
            generated_at: now,
            devices,
            available,
            admission,
            daemon,
            last_migration,
        })
    }
}
