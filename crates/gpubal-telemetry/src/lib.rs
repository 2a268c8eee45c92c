//! gpubal-telemetry: Device telemetry
//!
//! This crate provides everything on the producing side of the store:
//! - The `TelemetrySource` capability
//! - An `nvidia-smi` backed source
//! - A static source for development and tests
//! - The `MetricsCollector` polling loop

pub mod collector;
pub mod nvidia_smi;
pub mod source;
pub mod static_source;

pub use collector::{CollectionReport, CollectorConfig, CollectorHandle, MetricsCollector};
pub use nvidia_smi::NvidiaSmiSource;
pub use source::TelemetrySource;
pub use static_source::StaticSource;
