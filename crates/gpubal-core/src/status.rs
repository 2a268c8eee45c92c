//! Balance daemon status published for observability

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::{BalanceError, BalanceResult, BalanceStrategy};

/// Balance daemon lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DaemonState {
    Idle,
    Checking,
    Acting,
    Stopped,
}

impl std::fmt::Display for DaemonState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DaemonState::Idle => write!(f, "idle"),
            DaemonState::Checking => write!(f, "checking"),
            DaemonState::Acting => write!(f, "acting"),
            DaemonState::Stopped => write!(f, "stopped"),
        }
    }
}

impl std::str::FromStr for DaemonState {
    type Err = BalanceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(DaemonState::Idle),
            "checking" => Ok(DaemonState::Checking),
            "acting" => Ok(DaemonState::Acting),
            "stopped" => Ok(DaemonState::Stopped),
            other => Err(BalanceError::Serialization(format!(
                "unknown daemon state '{}'",
                other
            ))),
        }
    }
}

/// Status record of a balance daemon.
///
/// No component reads this to make decisions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DaemonStatus {
    pub state: DaemonState,
    pub last_run_ts: Option<DateTime<Utc>>,
    pub last_action: String,
    pub strategy: BalanceStrategy,
    /// Completed cycles since start
    pub cycles: u64,
    pub pid: u32,
    pub started_at: DateTime<Utc>,
}

impl DaemonStatus {
    pub fn new(strategy: BalanceStrategy) -> Self {
        Self {
            state: DaemonState::Idle,
            last_run_ts: None,
            last_action: "started".to_string(),
            strategy,
            cycles: 0,
            pid: std::process::id(),
            started_at: Utc::now(),
        }
    }

    pub fn to_fields(&self) -> Vec<(String, String)> {
        vec![
            ("state".to_string(), self.state.to_string()),
            (
                "last_run_ts".to_string(),
                self.last_run_ts.map(|t| t.to_rfc3339()).unwrap_or_default(),
            ),
            ("last_action".to_string(), self.last_action.clone()),
            ("strategy".to_string(), self.strategy.to_string()),
            ("cycles".to_string(), self.cycles.to_string()),
            ("pid".to_string(), self.pid.to_string()),
            ("started_at".to_string(), self.started_at.to_rfc3339()),
        ]
    }

    pub fn from_fields(fields: &HashMap<String, String>) -> BalanceResult<Self> {
        let get = |name: &str| {
            fields
                .get(name)
                .ok_or_else(|| BalanceError::Serialization(format!("missing field '{}'", name)))
        };
        let parse_ts = |raw: &str| {
            DateTime::parse_from_rfc3339(raw)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|e| BalanceError::Serialization(e.to_string()))
        };

        let last_run_ts = match get("last_run_ts")?.as_str() {
            "" => None,
            raw => Some(parse_ts(raw)?),
        };

        Ok(Self {
            state: get("state")?.parse()?,
            last_run_ts,
            last_action: get("last_action")?.clone(),
            strategy: get("strategy")?.parse()?,
            cycles: get("cycles")?
                .parse()
                .map_err(|_| BalanceError::Serialization("bad cycles".to_string()))?,
            pid: get("pid")?
                .parse()
                .map_err(|_| BalanceError::Serialization("bad pid".to_string()))?,
            started_at: parse_ts(get("started_at")?)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_fields() {
        let mut status = DaemonStatus::new(BalanceStrategy::ProcessMigration);
        status.state = DaemonState::Stopped;
        status.last_run_ts = Some(Utc::now());
        status.cycles = 7;

        let fields: HashMap<String, String> = status.to_fields().into_iter().collect();
        assert_eq!(fields["state"], "stopped");
        assert_eq!(fields["strategy"], "process_migration");

        let restored = DaemonStatus::from_fields(&fields).unwrap();
        assert_eq!(restored.state, DaemonState::Stopped);
        assert_eq!(restored.cycles, 7);
        assert!(restored.last_run_ts.is_some());
    }

    #[test]
    fn test_status_before_first_cycle() {
        let status = DaemonStatus::new(BalanceStrategy::NoMigration);
        let fields: HashMap<String, String> = status.to_fields().into_iter().collect();
        let restored = DaemonStatus::from_fields(&fields).unwrap();
        assert_eq!(restored.state, DaemonState::Idle);
        assert!(restored.last_run_ts.is_none());
    }
}
