//! Redis-backed state store

use async_trait::async_trait;
use gpubal_core::{
    AdmissionState, BalanceError, BalanceResult, DeviceId, MetricsSnapshot, StoreConfig,
};
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, RedisResult};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::future::Future;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::keys::{self, DeviceSet};
use crate::traits::StateStore;

/// State store backed by a Redis server.
///
/// The connection is opened lazily and reopened after a failure, so a store
/// that is down at startup does not prevent callers from degrading.
pub struct RedisStore {
    client: redis::Client,
    conn: Mutex<Option<MultiplexedConnection>>,
    timeout: Duration,
    retries: u32,
}

impl RedisStore {
    /// Create a store for the configured URL (no network round trip)
    pub fn new(config: &StoreConfig) -> BalanceResult<Self> {
        let client = redis::Client::open(config.url.as_str())
            .map_err(|e| BalanceError::ConfigInvalid(format!("REDIS_URL: {}", e)))?;
        Ok(Self {
            client,
            conn: Mutex::new(None),
            timeout: config.timeout,
            retries: config.retries.max(1),
        })
    }

    async fn connection(&self) -> Result<MultiplexedConnection, String> {
        let mut guard = self.conn.lock().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }

        let conn = tokio::time::timeout(
            self.timeout,
            self.client.get_multiplexed_async_connection(),
        )
        .await
        .map_err(|_| format!("connect timed out after {:?}", self.timeout))?
        .map_err(|e| e.to_string())?;

        info!("Connected to redis");
        *guard = Some(conn.clone());
        Ok(conn)
    }

    async fn reset(&self) {
        self.conn.lock().await.take();
    }

    /// Run one store round trip with a timeout and a bounded number of attempts
    async fn run<T, F, Fut>(&self, op: &'static str, f: F) -> BalanceResult<T>
    where
        F: Fn(MultiplexedConnection) -> Fut,
        Fut: Future<Output = RedisResult<T>>,
    {
        let mut last_error = String::new();

        for attempt in 1..=self.retries {
            let outcome = match self.connection().await {
                Ok(conn) => match tokio::time::timeout(self.timeout, f(conn)).await {
                    Ok(Ok(value)) => return Ok(value),
                    Ok(Err(e)) => e.to_string(),
                    Err(_) => format!("timed out after {:?}", self.timeout),
                },
                Err(e) => e,
            };

            debug!(op, attempt, error = %outcome, "Store operation failed");
            last_error = outcome;
            self.reset().await;
        }

        Err(BalanceError::StoreUnavailable(format!(
            "{} failed after {} attempts: {}",
            op, self.retries, last_error
        )))
    }
}

fn to_vec(ids: &BTreeSet<DeviceId>) -> Vec<DeviceId> {
    ids.iter().copied().collect()
}

#[async_trait]
impl StateStore for RedisStore {
    async fn put_snapshot(&self, snapshot: &MetricsSnapshot, ttl: Duration) -> BalanceResult<()> {
        let key = keys::metrics_key(snapshot.device_id);
        let fields = snapshot.to_fields();

        let mut pipe = redis::pipe();
        pipe.atomic()
            .del(&key)
            .ignore()
            .hset_multiple(&key, &fields)
            .ignore()
            .pexpire(&key, ttl.as_millis() as i64)
            .ignore()
            .sadd(keys::METRICS_INDEX, snapshot.device_id)
            .ignore();

        self.run("put_snapshot", |mut conn| {
            let pipe = &pipe;
            async move { pipe.query_async(&mut conn).await }
        })
        .await
    }

    async fn get_all_snapshots(&self) -> BalanceResult<BTreeMap<DeviceId, MetricsSnapshot>> {
        let ids: Vec<DeviceId> = self
            .run("get_all_snapshots", |mut conn| async move {
                conn.smembers(keys::METRICS_INDEX).await
            })
            .await?;

        if ids.is_empty() {
            return Ok(BTreeMap::new());
        }

        let mut pipe = redis::pipe();
        for id in &ids {
            pipe.hgetall(keys::metrics_key(*id));
        }
        let hashes: Vec<HashMap<String, String>> = self
            .run("get_all_snapshots", |mut conn| {
                let pipe = &pipe;
                async move { pipe.query_async(&mut conn).await }
            })
            .await?;

        let mut snapshots = BTreeMap::new();
        for (id, fields) in ids.into_iter().zip(hashes) {
            // An empty hash means the TTL lapsed
            if fields.is_empty() {
                continue;
            }
            match MetricsSnapshot::from_fields(&fields) {
                Ok(snapshot) => {
                    snapshots.insert(id, snapshot);
                }
                Err(e) => warn!(device = id, error = %e, "Skipping unreadable snapshot"),
            }
        }
        Ok(snapshots)
    }

    async fn set_add(&self, set: DeviceSet, ids: &[DeviceId]) -> BalanceResult<()> {
        if ids.is_empty() {
            return Ok(());
        }
        self.run("set_add", |mut conn| {
            let ids = ids.to_vec();
            async move { conn.sadd::<_, _, ()>(set.key(), ids).await }
        })
        .await
    }

    async fn set_remove(&self, set: DeviceSet, ids: &[DeviceId]) -> BalanceResult<()> {
        if ids.is_empty() {
            return Ok(());
        }
        self.run("set_remove", |mut conn| {
            let ids = ids.to_vec();
            async move { conn.srem::<_, _, ()>(set.key(), ids).await }
        })
        .await
    }

    async fn set_members(&self, set: DeviceSet) -> BalanceResult<BTreeSet<DeviceId>> {
        let ids: Vec<DeviceId> = self
            .run("set_members", |mut conn| async move {
                conn.smembers(set.key()).await
            })
            .await?;
        Ok(ids.into_iter().collect())
    }

    async fn set_replace(
        &self,
        set: DeviceSet,
        ids: &BTreeSet<DeviceId>,
        ttl: Option<Duration>,
    ) -> BalanceResult<()> {
        let mut pipe = redis::pipe();
        pipe.atomic().del(set.key()).ignore();
        if !ids.is_empty() {
            pipe.sadd(set.key(), to_vec(ids)).ignore();
            if let Some(ttl) = ttl {
                pipe.pexpire(set.key(), ttl.as_millis() as i64).ignore();
            }
        }

        self.run("set_replace", |mut conn| {
            let pipe = &pipe;
            async move { pipe.query_async(&mut conn).await }
        })
        .await
    }

    async fn replace_admission(&self, state: &AdmissionState) -> BalanceResult<()> {
        let state = state.clone().normalized();

        let mut pipe = redis::pipe();
        pipe.atomic();
        for (set, ids) in [
            (DeviceSet::Paused, &state.paused),
            (DeviceSet::Preferred, &state.preferred),
        ] {
            pipe.del(set.key()).ignore();
            if !ids.is_empty() {
                pipe.sadd(set.key(), to_vec(ids)).ignore();
            }
        }

        self.run("replace_admission", |mut conn| {
            let pipe = &pipe;
            async move { pipe.query_async(&mut conn).await }
        })
        .await
    }

    async fn put_hash(&self, key: &str, fields: &[(String, String)]) -> BalanceResult<()> {
        if fields.is_empty() {
            return Ok(());
        }
        self.run("put_hash", |mut conn| async move {
            conn.hset_multiple::<_, _, _, ()>(key, fields).await
        })
        .await
    }

    async fn get_hash(&self, key: &str) -> BalanceResult<HashMap<String, String>> {
        self.run("get_hash", |mut conn| async move { conn.hgetall(key).await })
            .await
    }

    async fn hash_remove(&self, key: &str, fields: &[String]) -> BalanceResult<()> {
        if fields.is_empty() {
            return Ok(());
        }
        self.run("hash_remove", |mut conn| {
            let fields = fields.to_vec();
            async move { conn.hdel::<_, _, ()>(key, fields).await }
        })
        .await
    }

    async fn delete(&self, key: &str) -> BalanceResult<()> {
        self.run("delete", |mut conn| async move {
            conn.del::<_, ()>(key).await
        })
        .await
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_url_rejected() {
        let config = StoreConfig {
            url: "not a url".to_string(),
            ..StoreConfig::default()
        };
        assert!(matches!(
            RedisStore::new(&config),
            Err(BalanceError::ConfigInvalid(_))
        ));
    }

    #[tokio::test]
    async fn test_unreachable_server_reports_unavailable() {
        let config = StoreConfig {
            url: "redis://127.0.0.1:1/0".to_string(),
            timeout: Duration::from_millis(200),
            retries: 2,
        };
        let store = RedisStore::new(&config).unwrap();
        let result = store.set_members(DeviceSet::Paused).await;
        assert!(matches!(result, Err(BalanceError::StoreUnavailable(_))));
    }
}
