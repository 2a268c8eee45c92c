//! Process lifecycle helpers shared by `gpubald` and `gpubal`

pub mod logging;
pub mod pidfile;
pub mod signal;

pub use logging::{init_logging, LogFormat};
pub use pidfile::PidFile;
