//! threadgrid-autoscale — grows the pool under stalls, shrinks it when idle.
//!
//! The dispatch layer pushes a [`StallSignal`] whenever a work item finds
//! no free thread. The upscale loop turns signals into booted slots; the
//! downscale loop reclaims autoscaled slots that sat idle.
//!
//! # Scaling Algorithm
//!
//! ```text
//! upscale, per stall signal:
//!     if autoscaled >= max_threads - min_threads: wait one tick, retry
//!     if age < min_stall_time:                    wait out the remainder
//!     if coordinator not Ready:                   skip
//!     if cpu_probe(cpu_probe_time) > max_cpu_usage: skip
//!     claim Inactive/Reserved slot, boot, wait for Ready, append
//!
//! downscale, every downscale_interval:
//!     for slot in autoscaled (newest first):
//!         Reserved                          → drop from list
//!         Ready, idle > max_idle_time       → park (or stop), drop from list
//!     at most max_deactivations_per_tick reclaims per sweep
//! ```
//!
//! Parking keeps the runtime instance booted; some runtime extensions
//! leak on repeated boot/shutdown. [`ReclaimPolicy::Stop`] tears the slot
//! down instead.
//!
//! [`ReclaimPolicy::Stop`]: threadgrid_core::ReclaimPolicy::Stop

pub mod error;
pub mod scaler;
pub mod stall;

pub use error::ScaleError;
pub use scaler::{AutoScaler, Capacity, ScaleOutcome, ScalerTasks};
pub use stall::{StallSender, StallSignal, stall_channel};
