//! In-process state store
//!
//! Used when every gpubal component runs inside one process, and as the fake
//! store in tests. Expiry follows the tokio clock so tests can pause and
//! advance time.

use async_trait::async_trait;
use gpubal_core::{AdmissionState, BalanceError, BalanceResult, DeviceId, MetricsSnapshot};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::debug;

use crate::keys::DeviceSet;
use crate::traits::StateStore;

#[derive(Default)]
struct Inner {
    snapshots: HashMap<DeviceId, (MetricsSnapshot, Instant)>,
    sets: HashMap<DeviceSet, (BTreeSet<DeviceId>, Option<Instant>)>,
    hashes: HashMap<String, HashMap<String, String>>,
}

impl Inner {
    fn live_set(&self, set: DeviceSet, now: Instant) -> BTreeSet<DeviceId> {
        match self.sets.get(&set) {
            Some((ids, expires)) if expires.map_or(true, |at| at > now) => ids.clone(),
            _ => BTreeSet::new(),
        }
    }

    fn set_mut(&mut self, set: DeviceSet, now: Instant) -> &mut BTreeSet<DeviceId> {
        let live = self.live_set(set, now);
        let entry = self.sets.entry(set).or_insert_with(|| (BTreeSet::new(), None));
        if entry.1.is_some_and(|at| at <= now) {
            *entry = (live, None);
        }
        &mut entry.0
    }
}

/// TTL-aware in-memory store
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
    unavailable: AtomicBool,
    failing_keys: Mutex<HashSet<String>>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate a lost connection: every operation fails with `StoreUnavailable`
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Make writes to `key` fail with `StoreUnavailable` while reads succeed
    pub fn fail_writes_to(&self, key: &str) {
        self.failing_keys
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string());
    }

    /// Undo every `fail_writes_to`
    pub fn clear_write_failures(&self) {
        self.failing_keys
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    fn check(&self) -> BalanceResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(BalanceError::StoreUnavailable(
                "memory store marked unavailable".to_string(),
            ));
        }
        Ok(())
    }

    fn check_write(&self, key: &str) -> BalanceResult<()> {
        self.check()?;
        let failing = self
            .failing_keys
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(key);
        if failing {
            return Err(BalanceError::StoreUnavailable(format!(
                "writes to '{}' marked failing",
                key
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn put_snapshot(&self, snapshot: &MetricsSnapshot, ttl: Duration) -> BalanceResult<()> {
        self.check()?;
        let expires = Instant::now() + ttl;
        self.inner
            .write()
            .await
            .snapshots
            .insert(snapshot.device_id, (snapshot.clone(), expires));
        debug!(device = snapshot.device_id, ttl = ?ttl, "Stored snapshot");
        Ok(())
    }

    async fn get_all_snapshots(&self) -> BalanceResult<BTreeMap<DeviceId, MetricsSnapshot>> {
        self.check()?;
        let now = Instant::now();
        let mut inner = self.inner.write().await;
        inner.snapshots.retain(|_, (_, expires)| *expires > now);
        Ok(inner
            .snapshots
            .iter()
            .map(|(id, (snapshot, _))| (*id, snapshot.clone()))
            .collect())
    }

    async fn set_add(&self, set: DeviceSet, ids: &[DeviceId]) -> BalanceResult<()> {
        self.check_write(set.key())?;
        let now = Instant::now();
        let mut inner = self.inner.write().await;
        inner.set_mut(set, now).extend(ids.iter().copied());
        Ok(())
    }

    async fn set_remove(&self, set: DeviceSet, ids: &[DeviceId]) -> BalanceResult<()> {
        self.check_write(set.key())?;
        let now = Instant::now();
        let mut inner = self.inner.write().await;
        let members = inner.set_mut(set, now);
        for id in ids {
            members.remove(id);
        }
        Ok(())
    }

    async fn set_members(&self, set: DeviceSet) -> BalanceResult<BTreeSet<DeviceId>> {
        self.check()?;
        Ok(self.inner.read().await.live_set(set, Instant::now()))
    }

    async fn set_replace(
        &self,
        set: DeviceSet,
        ids: &BTreeSet<DeviceId>,
        ttl: Option<Duration>,
    ) -> BalanceResult<()> {
        self.check_write(set.key())?;
        let expires = ttl.map(|ttl| Instant::now() + ttl);
        self.inner
            .write()
            .await
            .sets
            .insert(set, (ids.clone(), expires));
        Ok(())
    }

    async fn replace_admission(&self, state: &AdmissionState) -> BalanceResult<()> {
        self.check_write(DeviceSet::Paused.key())?;
        self.check_write(DeviceSet::Preferred.key())?;
        let state = state.clone().normalized();
        let mut inner = self.inner.write().await;
        inner.sets.insert(DeviceSet::Paused, (state.paused, None));
        inner.sets.insert(DeviceSet::Preferred, (state.preferred, None));
        Ok(())
    }

    async fn put_hash(&self, key: &str, fields: &[(String, String)]) -> BalanceResult<()> {
        self.check_write(key)?;
        let mut inner = self.inner.write().await;
        let hash = inner.hashes.entry(key.to_string()).or_default();
        for (field, value) in fields {
            hash.insert(field.clone(), value.clone());
        }
        Ok(())
    }

    async fn get_hash(&self, key: &str) -> BalanceResult<HashMap<String, String>> {
        self.check()?;
        Ok(self
            .inner
            .read()
            .await
            .hashes
            .get(key)
            .cloned()
            .unwrap_or_default())
    }

    async fn hash_remove(&self, key: &str, fields: &[String]) -> BalanceResult<()> {
        self.check_write(key)?;
        let mut inner = self.inner.write().await;
        if let Some(hash) = inner.hashes.get_mut(key) {
            for field in fields {
                hash.remove(field);
            }
            if hash.is_empty() {
                inner.hashes.remove(key);
            }
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> BalanceResult<()> {
        self.check_write(key)?;
        let mut inner = self.inner.write().await;
        inner.hashes.remove(key);
        for set in [DeviceSet::Available, DeviceSet::Paused, DeviceSet::Preferred] {
            if set.key() == key {
                inner.sets.remove(&set);
            }
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
