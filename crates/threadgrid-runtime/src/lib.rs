//! threadgrid-runtime — the boundary to the embedded language runtime.
//!
//! The pool never talks to the runtime directly. Everything it needs is
//! behind the [`EmbeddedRuntime`] trait:
//!
//! ```text
//! Coordinator::start
//!   ├── prime_environment(overrides)   once, before any slot boots
//!   ├── memory_limit()                 per-thread budget for "auto" sizing
//!   └── per ThreadSlot OS thread
//!       ├── boot(slot)                 on the slot's own thread
//!       └── shutdown(slot)             on the slot's own thread
//! ```
//!
//! The runtime is single-threaded and stateful: each slot owns exactly
//! one runtime instance, and `boot`/`shutdown` for a slot are always
//! invoked from that slot's dedicated OS thread.

pub mod overrides;
pub mod simulated;

pub use overrides::RuntimeOverrides;
pub use simulated::SimulatedRuntime;

/// An embedded, single-threaded runtime that can host one instance per
/// OS thread.
pub trait EmbeddedRuntime: Send + Sync + 'static {
    /// Prepare process-wide state before the first instance boots.
    ///
    /// Some runtime extensions read environment variables during their
    /// own startup, so this runs before any slot thread exists.
    fn prime_environment(&self, overrides: &RuntimeOverrides) -> anyhow::Result<()>;

    /// Initialize the runtime instance for `slot` on the calling thread.
    fn boot(&self, slot: usize) -> anyhow::Result<()>;

    /// Gracefully tear down the runtime instance for `slot`.
    fn shutdown(&self, slot: usize);

    /// The configured per-thread memory limit in bytes.
    ///
    /// `None` or a non-positive value means the limit is unknown or
    /// unlimited.
    fn memory_limit(&self) -> Option<i64>;
}
