//! gpubal-core: Core types for GPU fleet coordination
//!
//! This crate provides the fundamental types shared by every gpubal process:
//! - Device telemetry snapshots
//! - Admission hints (paused / preferred device sets)
//! - Balance daemon status
//! - Process records and migration requests
//! - Configuration types
//! - Error handling

pub mod admission;
pub mod config;
pub mod device;
pub mod error;
pub mod process;
pub mod status;

pub use admission::*;
pub use config::*;
pub use device::*;
pub use error::*;
pub use process::*;
pub use status::*;
