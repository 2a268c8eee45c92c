//! gpubal-balancer: Fleet rebalancing
//!
//! Classifies devices each cycle and steers future admission through the
//! paused / preferred hint sets. Running work is never touched.

pub mod classify;
pub mod daemon;
pub mod hysteresis;
pub mod threshold;

pub use classify::{classify, Assessment, DeviceClass, FleetAssessment};
pub use daemon::{BalanceDaemon, CycleOutcome, DaemonHandle};
pub use hysteresis::HysteresisTracker;
pub use threshold::{percentile, ThresholdEstimator, UtilBand};
