//! Registered compute processes and migration requests

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

use crate::{BalanceError, BalanceResult, DeviceId};

/// A compute process launched onto a device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessRecord {
    pub pid: u32,
    pub device: DeviceId,
    /// Caller-supplied job kind, e.g. "train" or "selfplay"
    pub task_type: String,
    pub started_at: DateTime<Utc>,
    /// Last sign of life reported by the launcher
    pub last_heartbeat: DateTime<Utc>,
}

impl ProcessRecord {
    pub fn new(pid: u32, device: DeviceId, task_type: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            pid,
            device,
            task_type: task_type.into(),
            started_at: now,
            last_heartbeat: now,
        }
    }

    /// Time since the last heartbeat, zero if the clock went backwards
    pub fn heartbeat_age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.last_heartbeat).to_std().unwrap_or(Duration::ZERO)
    }

    /// Whether the process heartbeat is within `timeout`
    pub fn is_alive(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        self.heartbeat_age(now) <= timeout
    }

    pub fn to_json(&self) -> BalanceResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(raw: &str) -> BalanceResult<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}

/// Least-recently-started process, ties broken by pid
pub fn oldest_process(records: &[ProcessRecord]) -> Option<&ProcessRecord> {
    records.iter().min_by(|a, b| {
        a.started_at
            .cmp(&b.started_at)
            .then_with(|| a.pid.cmp(&b.pid))
    })
}

/// Request to move one process off an overloaded device.
///
/// Written for an external agent; nothing in gpubal acts on it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationRequest {
    pub request_id: Uuid,
    pub pid: u32,
    pub source: DeviceId,
    pub target: DeviceId,
    pub requested_at: DateTime<Utc>,
}

impl MigrationRequest {
    pub fn new(pid: u32, source: DeviceId, target: DeviceId) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            pid,
            source,
            target,
            requested_at: Utc::now(),
        }
    }

    pub fn to_fields(&self) -> Vec<(String, String)> {
        vec![
            ("request_id".to_string(), self.request_id.to_string()),
            ("pid".to_string(), self.pid.to_string()),
            ("source".to_string(), self.source.to_string()),
            ("target".to_string(), self.target.to_string()),
            ("requested_at".to_string(), self.requested_at.to_rfc3339()),
        ]
    }

    pub fn from_fields(fields: &HashMap<String, String>) -> BalanceResult<Self> {
        let get = |name: &str| {
            fields
                .get(name)
                .map(String::as_str)
                .ok_or_else(|| BalanceError::Serialization(format!("missing field '{}'", name)))
        };
        let bad = |name: &str| BalanceError::Serialization(format!("bad value for '{}'", name));

        Ok(Self {
            request_id: get("request_id")?
                .parse()
                .map_err(|_| bad("request_id"))?,
            pid: get("pid")?.parse().map_err(|_| bad("pid"))?,
            source: get("source")?.parse().map_err(|_| bad("source"))?,
            target: get("target")?.parse().map_err(|_| bad("target"))?,
            requested_at: DateTime::parse_from_rfc3339(get("requested_at")?)
                .map_err(|_| bad("requested_at"))?
                .with_timezone(&Utc),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_oldest_process() {
        let now = Utc::now();
        let mut a = ProcessRecord::new(300, 1, "train");
        a.started_at = now;
        let mut b = ProcessRecord::new(200, 1, "selfplay");
        b.started_at = now - Duration::minutes(10);
        let mut c = ProcessRecord::new(100, 1, "selfplay");
        c.started_at = now - Duration::minutes(10);

        let records = vec![a, b, c];
        assert_eq!(oldest_process(&records).map(|r| r.pid), Some(100));
        assert!(oldest_process(&[]).is_none());
    }

    #[test]
    fn test_heartbeat_liveness() {
        let now = Utc::now();
        let mut record = ProcessRecord::new(55, 0, "selfplay");
        record.last_heartbeat = now - Duration::seconds(20);

        let timeout = std::time::Duration::from_secs(30);
        assert!(record.is_alive(now, timeout));
        assert!(!record.is_alive(now + Duration::seconds(15), timeout));
        // A heartbeat from the future counts as fresh
        assert_eq!(
            record.heartbeat_age(now - Duration::minutes(1)),
            std::time::Duration::ZERO
        );
    }

    #[test]
    fn test_process_record_json() {
        let record = ProcessRecord::new(4242, 3, "evaluate");
        let parsed = ProcessRecord::from_json(&record.to_json().unwrap()).unwrap();
        assert_eq!(parsed, record);
        assert!(ProcessRecord::from_json("{not json").is_err());
    }

    #[test]
    fn test_migration_request_fields() {
        let request = MigrationRequest::new(77, 1, 2);
        let fields: HashMap<_, _> = request.to_fields().into_iter().collect();
        let parsed = MigrationRequest::from_fields(&fields).unwrap();
        assert_eq!(parsed.request_id, request.request_id);
        assert_eq!((parsed.pid, parsed.source, parsed.target), (77, 1, 2));

        let mut broken = fields.clone();
        broken.insert("pid".to_string(), "abc".to_string());
        assert!(MigrationRequest::from_fields(&broken).is_err());
    }
}
