//! Device telemetry types

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::{BalanceError, BalanceResult};

/// Stable identifier of one GPU (the driver index)
pub type DeviceId = u32;

/// Version of the snapshot field layout written to the store
pub const SNAPSHOT_SCHEMA_VERSION: u32 = 1;

/// One raw reading returned by a telemetry source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceReading {
    /// Device index
    pub device_id: DeviceId,
    /// Device name
    pub name: String,
    /// Utilization percentage (0-100)
    pub util_pct: f64,
    /// Used memory in MB
    pub mem_used_mb: u64,
    /// Total memory in MB
    pub mem_total_mb: u64,
    /// Core temperature in Celsius
    pub temp_c: u32,
    /// Number of compute processes on the device
    pub process_count: u32,
}

/// Versioned, immutable telemetry snapshot of a device.
///
/// A new poll supersedes the previous snapshot; the store expires it when the
/// collector stops refreshing it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub device_id: DeviceId,
    pub name: String,
    pub timestamp: DateTime<Utc>,
    pub mem_used_mb: u64,
    pub mem_total_mb: u64,
    pub util_pct: f64,
    pub temp_c: u32,
    pub process_count: u32,
    pub schema_version: u32,
}

impl MetricsSnapshot {
    /// Stamp a reading taken at `at`
    pub fn from_reading(reading: DeviceReading, at: DateTime<Utc>) -> Self {
        Self {
            device_id: reading.device_id,
            name: reading.name,
            timestamp: at,
            mem_used_mb: reading.mem_used_mb,
            mem_total_mb: reading.mem_total_mb,
            util_pct: reading.util_pct.clamp(0.0, 100.0),
            temp_c: reading.temp_c,
            process_count: reading.process_count,
            schema_version: SNAPSHOT_SCHEMA_VERSION,
        }
    }

    /// Free memory in MB
    pub fn free_mem_mb(&self) -> u64 {
        self.mem_total_mb.saturating_sub(self.mem_used_mb)
    }

    /// Used memory as a percentage of total memory
    pub fn mem_used_pct(&self) -> f64 {
        if self.mem_total_mb == 0 {
            return 100.0;
        }
        (self.mem_used_mb as f64 / self.mem_total_mb as f64) * 100.0
    }

    /// Combined load score (0-100, higher is busier)
    pub fn load_score(&self) -> f64 {
        (self.util_pct + self.mem_used_pct()) / 2.0
    }

    /// Age of the snapshot relative to `now`
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now.signed_duration_since(self.timestamp)
    }

    /// Whether the snapshot is still inside the TTL window
    pub fn is_fresh(&self, now: DateTime<Utc>, ttl: std::time::Duration) -> bool {
        match Duration::from_std(ttl) {
            Ok(ttl) => self.age(now) <= ttl,
            Err(_) => true,
        }
    }

    /// Flatten into store hash fields
    pub fn to_fields(&self) -> Vec<(String, String)> {
        vec![
            ("device_id".to_string(), self.device_id.to_string()),
            ("name".to_string(), self.name.clone()),
            (
                "timestamp_ms".to_string(),
                self.timestamp.timestamp_millis().to_string(),
            ),
            ("mem_used_mb".to_string(), self.mem_used_mb.to_string()),
            ("mem_total_mb".to_string(), self.mem_total_mb.to_string()),
            ("util_pct".to_string(), self.util_pct.to_string()),
            ("temp_c".to_string(), self.temp_c.to_string()),
            ("process_count".to_string(), self.process_count.to_string()),
            ("schema_version".to_string(), self.schema_version.to_string()),
        ]
    }

    /// Rebuild a snapshot from store hash fields
    pub fn from_fields(fields: &HashMap<String, String>) -> BalanceResult<Self> {
        let schema_version: u32 = field(fields, "schema_version")?;
        if schema_version != SNAPSHOT_SCHEMA_VERSION {
            return Err(BalanceError::Serialization(format!(
                "unsupported snapshot schema version {}",
                schema_version
            )));
        }

        let millis: i64 = field(fields, "timestamp_ms")?;
        let timestamp = DateTime::<Utc>::from_timestamp_millis(millis).ok_or_else(|| {
            BalanceError::Serialization(format!("timestamp out of range: {}", millis))
        })?;

        Ok(Self {
            device_id: field(fields, "device_id")?,
            name: fields.get("name").cloned().unwrap_or_default(),
            timestamp,
            mem_used_mb: field(fields, "mem_used_mb")?,
            mem_total_mb: field(fields, "mem_total_mb")?,
            util_pct: field(fields, "util_pct")?,
            temp_c: field(fields, "temp_c")?,
            process_count: field(fields, "process_count")?,
            schema_version,
        })
    }
}

fn field<T: std::str::FromStr>(fields: &HashMap<String, String>, name: &str) -> BalanceResult<T> {
    let raw = fields
        .get(name)
        .ok_or_else(|| BalanceError::Serialization(format!("missing field '{}'", name)))?;
    raw.parse()
        .map_err(|_| BalanceError::Serialization(format!("bad value for '{}': {}", name, raw)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reading() -> DeviceReading {
        DeviceReading {
            device_id: 2,
            name: "Test GPU".to_string(),
            util_pct: 40.0,
            mem_used_mb: 4000,
            mem_total_mb: 12000,
            temp_c: 60,
            process_count: 1,
        }
    }

    #[test]
    fn test_free_memory_and_load() {
        let snap = MetricsSnapshot::from_reading(reading(), Utc::now());
        assert_eq!(snap.free_mem_mb(), 8000);
        assert!((snap.load_score() - (40.0 + 100.0 / 3.0) / 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_used_exceeds_total_saturates() {
        let mut r = reading();
        r.mem_used_mb = 20000;
        let snap = MetricsSnapshot::from_reading(r, Utc::now());
        assert_eq!(snap.free_mem_mb(), 0);
    }

    #[test]
    fn test_freshness() {
        let now = Utc::now();
        let snap = MetricsSnapshot::from_reading(reading(), now - Duration::seconds(20));
        assert!(!snap.is_fresh(now, std::time::Duration::from_secs(15)));
        assert!(snap.is_fresh(now, std::time::Duration::from_secs(30)));
    }

    #[test]
    fn test_fields_reject_unknown_schema() {
        let snap = MetricsSnapshot::from_reading(reading(), Utc::now());
        let mut fields: HashMap<String, String> = snap.to_fields().into_iter().collect();
        fields.insert("schema_version".to_string(), "99".to_string());
        assert!(MetricsSnapshot::from_fields(&fields).is_err());

        fields.remove("schema_version");
        assert!(MetricsSnapshot::from_fields(&fields).is_err());
    }

    #[test]
    fn test_fields_restore_snapshot() {
        let snap = MetricsSnapshot::from_reading(reading(), Utc::now());
        let fields: HashMap<String, String> = snap.to_fields().into_iter().collect();
        let restored = MetricsSnapshot::from_fields(&fields).unwrap();
        assert_eq!(restored.device_id, 2);
        assert_eq!(restored.free_mem_mb(), 8000);
        assert_eq!(
            restored.timestamp.timestamp_millis(),
            snap.timestamp.timestamp_millis()
        );
    }
}
