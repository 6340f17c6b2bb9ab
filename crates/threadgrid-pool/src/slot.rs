//! ThreadSlot — one fixed-index unit of thread capacity.
//!
//! A slot owns a dedicated OS thread that hosts exactly one runtime
//! instance. The thread is spawned on the first boot, boots the runtime,
//! and then sleeps until the slot is asked to shut down. Parking a slot
//! (Ready → Inactive) leaves the thread and the instance alive, so
//! reactivation is only a state change.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, error, warn};

use threadgrid_runtime::EmbeddedRuntime;

use crate::error::{PoolError, PoolResult};
use crate::state::{Lifecycle, SlotState, StateCell};
use crate::worker::SlotTarget;

/// Idle bookkeeping for the downscale sweep.
#[derive(Debug)]
struct Activity {
    /// `None` while the slot is executing work.
    idle_since: Option<Instant>,
}

pub struct ThreadSlot {
    index: usize,
    state: StateCell<SlotState>,
    target: Mutex<SlotTarget>,
    activity: Mutex<Activity>,
    /// Set once the process drains; teardown then ends in `Done`
    /// instead of returning the slot to `Reserved`.
    finalize: AtomicBool,
    /// Whether the OS thread currently holds a booted runtime instance.
    runtime_live: AtomicBool,
    last_error: Mutex<Option<String>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl ThreadSlot {
    pub(crate) fn new(index: usize) -> Arc<Self> {
        Arc::new(Self {
            index,
            state: StateCell::new(SlotState::Reserved),
            target: Mutex::new(SlotTarget::Regular),
            activity: Mutex::new(Activity { idle_since: None }),
            finalize: AtomicBool::new(false),
            runtime_live: AtomicBool::new(false),
            last_error: Mutex::new(None),
            thread: Mutex::new(None),
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn state(&self) -> SlotState {
        self.state.get()
    }

    pub fn is(&self, state: SlotState) -> bool {
        self.state.is(state)
    }

    /// What the slot was last booted for.
    pub fn target(&self) -> SlotTarget {
        lock(&self.target).clone()
    }

    /// The most recent boot failure, if any.
    pub fn last_error(&self) -> Option<String> {
        lock(&self.last_error).clone()
    }

    /// Block until the slot is in one of `states`. No timeout.
    pub fn wait_for(&self, states: &[SlotState]) -> SlotState {
        self.state.wait_for(states)
    }

    pub fn wait_for_timeout(&self, states: &[SlotState], timeout: Duration) -> Option<SlotState> {
        self.state.wait_for_timeout(states, timeout)
    }

    /// The dispatch layer handed this slot a work item.
    pub fn mark_busy(&self) {
        lock(&self.activity).idle_since = None;
    }

    /// The slot finished its work item and is waiting for the next one.
    pub fn mark_idle(&self) {
        lock(&self.activity).idle_since = Some(Instant::now());
    }

    /// How long a Ready slot has been waiting for work.
    ///
    /// Zero while busy or in any state other than Ready.
    pub fn wait_time(&self) -> Duration {
        if !self.is(SlotState::Ready) {
            return Duration::ZERO;
        }
        lock(&self.activity)
            .idle_since
            .map(|since| since.elapsed())
            .unwrap_or(Duration::ZERO)
    }

    pub(crate) fn compare_and_swap(&self, from: SlotState, to: SlotState) -> PoolResult<bool> {
        self.state
            .compare_and_swap(from, to)
            .map_err(|e| PoolError::InvalidTransition {
                slot: Some(self.index),
                from: e.from,
                to: e.to,
            })
    }

    /// Claim the slot if it is currently in `from` (Inactive or Reserved).
    pub(crate) fn claim_from(&self, from: SlotState) -> PoolResult<bool> {
        self.compare_and_swap(from, SlotState::BootRequested)
    }

    /// Bring a claimed slot to Ready for `target`.
    ///
    /// A parked slot still holds its instance and becomes Ready at once.
    /// Otherwise the slot's OS thread is spawned and boots the runtime;
    /// this returns before the boot finishes, so callers wait for Ready
    /// (or Reserved, on failure).
    pub(crate) fn boot(
        self: &Arc<Self>,
        runtime: Arc<dyn EmbeddedRuntime>,
        target: SlotTarget,
    ) -> PoolResult<()> {
        if !self.is(SlotState::BootRequested) {
            return Err(PoolError::InvalidTransition {
                slot: Some(self.index),
                from: self.state().name(),
                to: SlotState::Ready.name(),
            });
        }

        *lock(&self.target) = target;

        if self.runtime_live.load(Ordering::SeqCst) {
            self.mark_idle();
            self.compare_and_swap(SlotState::BootRequested, SlotState::Ready)?;
            debug!(slot = self.index, "thread reactivated");
            return Ok(());
        }

        // A previous thread may still be returning after a stop.
        self.join_thread();

        let slot = Arc::clone(self);
        let spawned = std::thread::Builder::new()
            .name(format!("threadgrid-{}", self.index))
            .spawn(move || slot.run(runtime));

        match spawned {
            Ok(handle) => {
                *lock(&self.thread) = Some(handle);
                Ok(())
            }
            Err(e) => {
                let reason = format!("failed to spawn OS thread: {e}");
                self.fail_boot(&reason)?;
                Err(PoolError::BootFailed {
                    slot: self.index,
                    reason,
                })
            }
        }
    }

    /// Body of the slot's OS thread.
    fn run(self: Arc<Self>, runtime: Arc<dyn EmbeddedRuntime>) {
        let booted = catch_unwind(AssertUnwindSafe(|| runtime.boot(self.index)));
        let failure = match booted {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(format!("{e:#}")),
            Err(_) => Some("runtime panicked during boot".to_string()),
        };
        if let Some(reason) = failure {
            error!(slot = self.index, error = %reason, "thread failed to boot");
            if let Err(e) = self.fail_boot(&reason) {
                error!(slot = self.index, error = %e, "could not release thread after failed boot");
            }
            return;
        }

        self.runtime_live.store(true, Ordering::SeqCst);
        *lock(&self.last_error) = None;
        self.mark_idle();
        if let Err(e) = self.compare_and_swap(SlotState::BootRequested, SlotState::Ready) {
            error!(slot = self.index, error = %e, "thread booted in unexpected state");
        }

        // Ready and Inactive both keep the instance; only teardown ends the thread.
        self.state.wait_for(&[SlotState::ShuttingDown]);

        runtime.shutdown(self.index);
        self.runtime_live.store(false, Ordering::SeqCst);
        self.mark_busy();

        let next = if self.finalize.load(Ordering::SeqCst) {
            SlotState::Done
        } else {
            SlotState::Reserved
        };
        if let Err(e) = self.compare_and_swap(SlotState::ShuttingDown, next) {
            error!(slot = self.index, error = %e, "thread shut down in unexpected state");
        }
        debug!(slot = self.index, state = %next, "thread exited");
    }

    fn fail_boot(&self, reason: &str) -> PoolResult<()> {
        *lock(&self.last_error) = Some(reason.to_string());
        self.compare_and_swap(SlotState::BootRequested, SlotState::Reserved)?;
        Ok(())
    }

    /// Park a Ready slot. Returns `false` if the slot was not Ready.
    pub(crate) fn deactivate(&self) -> PoolResult<bool> {
        let parked = self.compare_and_swap(SlotState::Ready, SlotState::Inactive)?;
        if parked {
            self.mark_busy();
        }
        Ok(parked)
    }

    /// Tear the slot down for good. Ends in `Done`.
    ///
    /// Waits for an in-flight boot to finish first; a Reserved slot goes
    /// straight to Done without ever booting.
    pub(crate) fn shutdown(&self) -> PoolResult<()> {
        self.finalize.store(true, Ordering::SeqCst);
        self.tear_down(SlotState::Done)
    }

    /// Tear down the runtime instance and return the slot to Reserved.
    ///
    /// If the process is draining concurrently the slot ends in Done.
    pub(crate) fn stop(&self) -> PoolResult<()> {
        self.tear_down(SlotState::Reserved)
    }

    fn tear_down(&self, want: SlotState) -> PoolResult<()> {
        loop {
            match self.state() {
                SlotState::Done => break,
                SlotState::Reserved if want == SlotState::Reserved => break,
                SlotState::Reserved => {
                    if self.compare_and_swap(SlotState::Reserved, SlotState::Done)? {
                        break;
                    }
                }
                state @ (SlotState::Ready | SlotState::Inactive) => {
                    self.compare_and_swap(state, SlotState::ShuttingDown)?;
                }
                state @ (SlotState::BootRequested | SlotState::ShuttingDown) => {
                    self.state.wait_while(state);
                }
            }
        }
        self.join_thread();
        Ok(())
    }

    fn join_thread(&self) {
        let handle = lock(&self.thread).take();
        if let Some(handle) = handle
            && handle.join().is_err()
        {
            warn!(slot = self.index, "thread panicked before exiting");
        }
    }
}

/// A slot held in `BootRequested` on behalf of a caller.
///
/// Pass it to [`Coordinator::activate`](crate::Coordinator::activate) to
/// boot it. Dropping it unactivated hands the slot back to the state it
/// was claimed from, so a drain waiting on the claim can proceed.
#[must_use = "an unactivated claim is released on drop"]
pub struct ThreadClaim {
    slot: Arc<ThreadSlot>,
    release_to: Option<SlotState>,
}

impl ThreadClaim {
    pub(crate) fn new(slot: Arc<ThreadSlot>, from: SlotState) -> Self {
        Self {
            slot,
            release_to: Some(from),
        }
    }

    pub fn slot(&self) -> &Arc<ThreadSlot> {
        &self.slot
    }

    pub fn index(&self) -> usize {
        self.slot.index
    }

    /// The state the slot was claimed from.
    pub fn claimed_from(&self) -> Option<SlotState> {
        self.release_to
    }

    /// Take ownership of the claim; the caller now drives the boot.
    pub(crate) fn into_slot(mut self) -> Arc<ThreadSlot> {
        self.release_to = None;
        Arc::clone(&self.slot)
    }
}

impl Drop for ThreadClaim {
    fn drop(&mut self) {
        let Some(from) = self.release_to.take() else {
            return;
        };
        match self.slot.compare_and_swap(SlotState::BootRequested, from) {
            Ok(true) => debug!(slot = self.slot.index, state = %from, "claim released"),
            Ok(false) => {}
            Err(e) => error!(slot = self.slot.index, error = %e, "could not release claim"),
        }
    }
}

impl std::fmt::Debug for ThreadClaim {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadClaim")
            .field("index", &self.slot.index)
            .field("claimed_from", &self.release_to)
            .finish()
    }
}

impl std::fmt::Debug for ThreadSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadSlot")
            .field("index", &self.index)
            .field("state", &self.state())
            .field("target", &self.target())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
