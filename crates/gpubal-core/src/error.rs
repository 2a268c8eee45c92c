//! Error types for gpubal

use thiserror::Error;

use crate::DeviceId;

/// Main error type for gpubal
#[derive(Error, Debug)]
pub enum BalanceError {
    /// A single device could not be queried this cycle
    #[error("Telemetry unavailable for device {device}: {reason}")]
    TelemetryUnavailable { device: DeviceId, reason: String },

    /// The shared state store could not be reached
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// Configuration rejected at startup
    #[error("Invalid configuration: {0}")]
    ConfigInvalid(String),

    /// Malformed allocation or registry request
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl BalanceError {
    /// Shorthand for a per-device telemetry failure
    pub fn telemetry(device: DeviceId, reason: impl Into<String>) -> Self {
        BalanceError::TelemetryUnavailable {
            device,
            reason: reason.into(),
        }
    }

    /// Whether the error is transient and the owning loop should simply try
    /// again next interval.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            BalanceError::TelemetryUnavailable { .. } | BalanceError::StoreUnavailable(_)
        )
    }
}

/// Result type for gpubal operations
pub type BalanceResult<T> = Result<T, BalanceError>;

impl From<serde_json::Error> for BalanceError {
    fn from(err: serde_json::Error) -> Self {
        BalanceError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for BalanceError {
    fn from(err: toml::de::Error) -> Self {
        BalanceError::ConfigInvalid(err.to_string())
    }
}

impl From<config::ConfigError> for BalanceError {
    fn from(err: config::ConfigError) -> Self {
        BalanceError::ConfigInvalid(err.to_string())
    }
}
