//! gpubal-scheduler: GPU allocation for job launchers
//!
//! Allocation is advisory and read-only: nothing is reserved, and concurrent
//! callers may receive overlapping device lists.

pub mod fleet;
pub mod ranking;
pub mod request;
pub mod scheduler;

pub use fleet::{DeviceView, FleetView};
pub use ranking::{rank_candidates, Limits};
pub use request::{Allocation, AllocationMode, AllocationRequest, Constraints, DeviceCount};
pub use scheduler::TaskScheduler;
