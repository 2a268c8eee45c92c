//! Read-only aggregate of the shared state, for operators

use chrono::{DateTime, Utc};
use gpubal_core::{AdmissionState, DaemonStatus, DeviceId, MetricsSnapshot, MigrationRequest};
use serde::Serialize;
use std::collections::BTreeSet;

#[derive(Debug, Clone, Serialize)]
pub struct DeviceView {
    pub snapshot: MetricsSnapshot,
    /// Snapshot younger than the metrics TTL
    pub fresh: bool,
    pub available: bool,
    pub paused: bool,
    pub preferred: bool,
    /// Registered processes on the device
    pub processes: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct FleetView {
    pub generated_at: DateTime<Utc>,
    pub devices: Vec<DeviceView>,
    pub available: BTreeSet<DeviceId>,
    pub admission: AdmissionState,
    pub daemon: Option<DaemonStatus>,
    pub last_migration: Option<MigrationRequest>,
}

impl FleetView {
    pub fn device(&self, id: DeviceId) -> Option<&DeviceView> {
        self.devices.iter().find(|d| d.snapshot.device_id == id)
    }

    /// Mean utilization over fresh devices
    pub fn average_util(&self) -> Option<f64> {
        let fresh: Vec<f64> = self
            .devices
            .iter()
            .filter(|d| d.fresh)
            .map(|d| d.snapshot.util_pct)
            .collect();
        if fresh.is_empty() {
            return None;
        }
        Some(fresh.iter().sum::<f64>() / fresh.len() as f64)
    }

    /// Free memory summed over fresh devices
    pub fn total_free_mem_mb(&self) -> u64 {
        self.devices
            .iter()
            .filter(|d| d.fresh)
            .map(|d| d.snapshot.free_mem_mb())
            .sum()
    }
}
