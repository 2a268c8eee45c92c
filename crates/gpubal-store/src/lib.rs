//! gpubal-store: Shared state store
//!
//! This crate provides the only state shared between gpubal processes:
//! - The `StateStore` capability with explicit atomic operations
//! - The key schema used by every implementation
//! - An in-process, TTL-aware store for single-host use and tests
//! - A Redis-backed store for fleets
//! - The process registry kept alongside device state

pub mod keys;
pub mod memory;
pub mod redis_store;
pub mod registry;
pub mod traits;

pub use keys::DeviceSet;
pub use memory::MemoryStore;
pub use redis_store::RedisStore;
pub use registry::ProcessRegistry;
pub use traits::StateStore;
