//! threadgrid-cpu — CPU probing for scale-up decisions.
//!
//! Before the autoscaler adds a thread it samples CPU usage over a short
//! window. Adding a thread to a saturated machine only adds contention,
//! so a probe above the ceiling declines the scale-up.
//!
//! ```text
//! probe(window, ceiling, done)
//!   ├── sample process CPU time
//!   ├── sleep(window)  ── or ── done signal → Interrupted
//!   ├── sample again
//!   └── usage = cpu_delta / (wall_delta × cpus)  → Below / Above
//! ```

pub mod probe;

pub use probe::{CpuProber, FixedCpuProber, ProbeOutcome, ProcessCpuProber};
