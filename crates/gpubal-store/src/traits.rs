//! State store trait definitions

use async_trait::async_trait;
use gpubal_core::{AdmissionState, BalanceResult, DeviceId, MetricsSnapshot};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Duration;

use crate::keys::DeviceSet;

/// Networked key-value store shared by all gpubal processes.
///
/// Every operation is a single round trip and may fail with
/// `StoreUnavailable`. Multi-step updates are expressed as one atomic call
/// (`set_replace`, `replace_admission`) rather than read-then-write.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Publish a device snapshot that expires after `ttl`
    async fn put_snapshot(&self, snapshot: &MetricsSnapshot, ttl: Duration) -> BalanceResult<()>;

    /// All snapshots whose TTL has not lapsed
    async fn get_all_snapshots(&self) -> BalanceResult<BTreeMap<DeviceId, MetricsSnapshot>>;

    /// Add devices to a set
    async fn set_add(&self, set: DeviceSet, ids: &[DeviceId]) -> BalanceResult<()>;

    /// Remove devices from a set
    async fn set_remove(&self, set: DeviceSet, ids: &[DeviceId]) -> BalanceResult<()>;

    /// Current members of a set
    async fn set_members(&self, set: DeviceSet) -> BalanceResult<BTreeSet<DeviceId>>;

    /// Atomically replace the whole set, optionally with an expiry
    async fn set_replace(
        &self,
        set: DeviceSet,
        ids: &BTreeSet<DeviceId>,
        ttl: Option<Duration>,
    ) -> BalanceResult<()>;

    /// Atomically replace both admission hint sets
    async fn replace_admission(&self, state: &AdmissionState) -> BalanceResult<()>;

    /// Write fields into a hash
    async fn put_hash(&self, key: &str, fields: &[(String, String)]) -> BalanceResult<()>;

    /// Read a hash; an absent key yields an empty map
    async fn get_hash(&self, key: &str) -> BalanceResult<HashMap<String, String>>;

    /// Remove fields from a hash
    async fn hash_remove(&self, key: &str, fields: &[String]) -> BalanceResult<()>;

    /// Delete a key of any type
    async fn delete(&self, key: &str) -> BalanceResult<()>;

    /// Read both admission sets.
    ///
    /// The two reads may straddle a concurrent update; overlap is resolved in
    /// favour of `paused`.
    async fn get_admission(&self) -> BalanceResult<AdmissionState> {
        let paused = self.set_members(DeviceSet::Paused).await?;
        let preferred = self.set_members(DeviceSet::Preferred).await?;
        Ok(AdmissionState::new(paused, preferred))
    }

    /// Get the store name
    fn name(&self) -> &'static str;
}
