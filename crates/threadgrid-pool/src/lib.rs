//! threadgrid-pool — fixed-capacity pool of runtime-hosting OS threads.
//!
//! Capacity is a fixed array of `max_threads` slots allocated at startup.
//! The first `min_threads` are booted eagerly; the rest stay Reserved
//! until the autoscaler claims them.
//!
//! # Architecture
//!
//! ```text
//! Coordinator
//!   ├── StateCell<CoordinatorState>   Uninitialized → Starting → Ready → ShuttingDown → Done
//!   ├── DoneSignal                    closed once, at the start of a drain
//!   ├── EmbeddedRuntime               primed once, booted per slot
//!   └── [ThreadSlot; max_threads]
//!       ├── StateCell<SlotState>
//!       ├── dedicated OS thread        boot → wait → shutdown
//!       └── SlotTarget                 regular or a named worker
//! ```
//!
//! All blocking operations here (start, drain, add_thread, stop_slot)
//! are synchronous and must be called off the async executor, e.g. via
//! `tokio::task::spawn_blocking`.

pub mod coordinator;
pub mod done;
pub mod error;
pub mod slot;
pub mod state;
pub mod worker;

pub use coordinator::{Coordinator, SlotCounts};
pub use done::DoneSignal;
pub use error::{PoolError, PoolResult};
pub use slot::{ThreadClaim, ThreadSlot};
pub use state::{CoordinatorState, IllegalTransition, Lifecycle, SlotState, StateCell};
pub use worker::{SlotTarget, WorkerDefinition, WorkerKey, WorkerRegistry};
