//! threadgrid-core — shared configuration and sizing for the thread pool.
//!
//! - **Configuration**: `threadgrid.toml` parsing into typed settings
//!   for the pool, the autoscaler, and the embedded runtime
//! - **Capacity estimation**: derives the maximum thread count from total
//!   system memory and the per-thread memory budget when `max_threads`
//!   is set to `"auto"`

pub mod capacity;
pub mod config;
pub mod error;

pub use capacity::{compute_max_threads, total_system_memory};
pub use config::{
    MaxThreads, PoolSettings, ReclaimPolicy, RuntimeSettings, ScalingSettings, Settings,
    ThreadgridConfig,
};
pub use error::{ConfigError, ConfigResult};
