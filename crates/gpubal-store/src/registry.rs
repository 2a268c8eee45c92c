//! Per-device registry of launched compute processes

use chrono::Utc;
use gpubal_core::{BalanceResult, DeviceId, ProcessRecord};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::keys;
use crate::traits::StateStore;

/// Typed view over the `gpu:{id}:processes` hashes (pid -> record JSON)
#[derive(Clone)]
pub struct ProcessRegistry {
    store: Arc<dyn StateStore>,
}

impl ProcessRegistry {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }

    /// Record a process on its device, replacing any record with the same pid
    pub async fn register(&self, record: &ProcessRecord) -> BalanceResult<()> {
        let fields = [(record.pid.to_string(), record.to_json()?)];
        self.store
            .put_hash(&keys::processes_key(record.device), &fields)
            .await?;
        debug!(pid = record.pid, device = record.device, task_type = %record.task_type, "Registered process");
        Ok(())
    }

    /// Forget a process; returns whether it was registered
    pub async fn unregister(&self, device: DeviceId, pid: u32) -> BalanceResult<bool> {
        let key = keys::processes_key(device);
        let field = pid.to_string();
        let existed = self.store.get_hash(&key).await?.contains_key(&field);
        self.store.hash_remove(&key, &[field]).await?;
        debug!(pid, device, existed, "Unregistered process");
        Ok(existed)
    }

    /// Refresh a process heartbeat; returns false if it is not registered
    pub async fn heartbeat(&self, device: DeviceId, pid: u32) -> BalanceResult<bool> {
        let key = keys::processes_key(device);
        let hash = self.store.get_hash(&key).await?;
        let Some(raw) = hash.get(&pid.to_string()) else {
            return Ok(false);
        };
        let mut record = ProcessRecord::from_json(raw)?;
        record.last_heartbeat = Utc::now();
        self.register(&record).await?;
        Ok(true)
    }

    /// Remove records whose heartbeat is older than `timeout`, returning them
    pub async fn prune_stale(
        &self,
        device: DeviceId,
        timeout: Duration,
    ) -> BalanceResult<Vec<ProcessRecord>> {
        let now = Utc::now();
        let stale: Vec<ProcessRecord> = self
            .list(device)
            .await?
            .into_iter()
            .filter(|r| !r.is_alive(now, timeout))
            .collect();
        if stale.is_empty() {
            return Ok(stale);
        }

        let fields: Vec<String> = stale.iter().map(|r| r.pid.to_string()).collect();
        self.store
            .hash_remove(&keys::processes_key(device), &fields)
            .await?;
        for record in &stale {
            info!(
                pid = record.pid,
                device,
                age = ?record.heartbeat_age(now),
                "Removed process with expired heartbeat"
            );
        }
        Ok(stale)
    }

    /// Records on one device, oldest first
    pub async fn list(&self, device: DeviceId) -> BalanceResult<Vec<ProcessRecord>> {
        let hash = self.store.get_hash(&keys::processes_key(device)).await?;
        let mut records: Vec<ProcessRecord> = hash
            .iter()
            .filter_map(|(pid, raw)| match ProcessRecord::from_json(raw) {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!(device, pid = %pid, error = %e, "Skipping unreadable process record");
                    None
                }
            })
            .collect();
        records.sort_by(|a, b| a.started_at.cmp(&b.started_at).then(a.pid.cmp(&b.pid)));
        Ok(records)
    }
}
