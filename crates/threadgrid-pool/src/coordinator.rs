//! Coordinator — owns the slot array and the pool's lifecycle.
//!
//! Startup order matters:
//!
//! 1. prime the runtime environment (before any slot thread exists)
//! 2. boot slot 0 synchronously; failure here is fatal
//! 3. compute `max_threads` (needs the runtime's memory limit)
//! 4. allocate the remaining slots as Reserved
//! 5. boot slots `1..min_threads` concurrently and wait for all of them
//!
//! Draining closes the done signal, finalizes Reserved slots directly,
//! shuts every other slot down concurrently, and finishes once all slots
//! are terminal.

use std::sync::{Arc, OnceLock};

use tracing::{debug, error, info, warn};

use threadgrid_core::{PoolSettings, compute_max_threads, total_system_memory};
use threadgrid_runtime::{EmbeddedRuntime, RuntimeOverrides};

use crate::done::DoneSignal;
use crate::error::{PoolError, PoolResult};
use crate::slot::{ThreadClaim, ThreadSlot};
use crate::state::{CoordinatorState, Lifecycle, SlotState, StateCell};
use crate::worker::SlotTarget;

/// Per-state slot counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SlotCounts {
    pub reserved: usize,
    pub boot_requested: usize,
    pub ready: usize,
    pub inactive: usize,
    pub shutting_down: usize,
    pub done: usize,
}

impl SlotCounts {
    pub fn total(&self) -> usize {
        self.reserved
            + self.boot_requested
            + self.ready
            + self.inactive
            + self.shutting_down
            + self.done
    }
}

pub struct Coordinator {
    runtime: Arc<dyn EmbeddedRuntime>,
    settings: PoolSettings,
    overrides: RuntimeOverrides,
    state: StateCell<CoordinatorState>,
    done: DoneSignal,
    /// Allocated once at startup and never resized.
    slots: OnceLock<Vec<Arc<ThreadSlot>>>,
}

impl Coordinator {
    pub fn new(
        runtime: Arc<dyn EmbeddedRuntime>,
        settings: PoolSettings,
        overrides: RuntimeOverrides,
    ) -> Self {
        Self {
            runtime,
            settings,
            overrides,
            state: StateCell::new(CoordinatorState::Uninitialized),
            done: DoneSignal::new(),
            slots: OnceLock::new(),
        }
    }

    pub fn state(&self) -> CoordinatorState {
        self.state.get()
    }

    pub fn is_ready(&self) -> bool {
        self.state.is(CoordinatorState::Ready)
    }

    pub fn done(&self) -> &DoneSignal {
        &self.done
    }

    pub fn runtime(&self) -> &Arc<dyn EmbeddedRuntime> {
        &self.runtime
    }

    pub fn min_threads(&self) -> usize {
        self.settings.min_threads.max(1)
    }

    /// Effective cap; equals `min_threads` until startup computed it.
    pub fn max_threads(&self) -> usize {
        self.slots
            .get()
            .map(Vec::len)
            .unwrap_or_else(|| self.min_threads())
    }

    pub fn slots(&self) -> &[Arc<ThreadSlot>] {
        self.slots.get().map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn slot(&self, index: usize) -> Option<&Arc<ThreadSlot>> {
        self.slots().get(index)
    }

    pub fn slot_counts(&self) -> SlotCounts {
        let mut counts = SlotCounts::default();
        for slot in self.slots() {
            match slot.state() {
                SlotState::Reserved => counts.reserved += 1,
                SlotState::BootRequested => counts.boot_requested += 1,
                SlotState::Ready => counts.ready += 1,
                SlotState::Inactive => counts.inactive += 1,
                SlotState::ShuttingDown => counts.shutting_down += 1,
                SlotState::Done => counts.done += 1,
            }
        }
        counts
    }

    /// Boot the warm pool and reserve the remaining capacity.
    ///
    /// Blocks until every warm slot has settled. Only a failure to prime
    /// the environment or to boot the first slot is an error; later warm
    /// slots that fail are logged and left Reserved.
    pub fn start(&self) -> PoolResult<()> {
        if !self.transition(CoordinatorState::Uninitialized, CoordinatorState::Starting)? {
            return Err(PoolError::AlreadyStarted);
        }
        let min_threads = self.min_threads();
        debug!(min_threads, max_threads = ?self.settings.max_threads, "initializing threads");

        if !self.overrides.is_empty() {
            debug!(overrides = %self.overrides.render().trim_end(), "priming runtime overrides");
        }
        if let Err(e) = self.runtime.prime_environment(&self.overrides) {
            error!(error = %e, "failed to prime runtime environment");
            self.abort_start()?;
            return Err(PoolError::EnvironmentPriming(e));
        }

        let first = ThreadSlot::new(0);
        if let Err(e) = self.activate_slot(&first, SlotTarget::Regular) {
            error!(error = %e, "failed to start the first thread");
            self.abort_start()?;
            let reason = first.last_error().unwrap_or_else(|| e.to_string());
            return Err(PoolError::MainThreadCreation(reason));
        }
        debug!("first thread started");

        let budget = self
            .settings
            .memory_budget
            .or_else(|| self.runtime.memory_limit());
        let max_threads = compute_max_threads(
            min_threads,
            self.settings.max_threads,
            budget,
            total_system_memory(),
        );

        let mut slots = Vec::with_capacity(max_threads);
        slots.push(first);
        slots.extend((1..max_threads).map(ThreadSlot::new));
        let slots = self.slots.get_or_init(|| slots);

        std::thread::scope(|scope| {
            for slot in &slots[1..min_threads] {
                scope.spawn(move || {
                    debug!(slot = slot.index(), "booting thread");
                    match self.activate_slot(slot, SlotTarget::Regular) {
                        Ok(()) => debug!(slot = slot.index(), "thread booted"),
                        Err(e) => {
                            warn!(slot = slot.index(), error = %e, "warm thread failed to boot")
                        }
                    }
                });
            }
        });

        self.transition(CoordinatorState::Starting, CoordinatorState::Ready)?;
        if self.done.is_closed() {
            info!("drain requested during startup, tearing threads down");
            self.drain();
            return Err(PoolError::NotReady(self.state().name()));
        }
        info!(min_threads, max_threads, "all threads initialized");
        Ok(())
    }

    fn abort_start(&self) -> PoolResult<()> {
        self.done.close();
        self.transition(CoordinatorState::Starting, CoordinatorState::Done)?;
        Ok(())
    }

    /// Claim a parked or reserved slot without booting it.
    ///
    /// Parked slots are preferred since they reactivate without a boot.
    /// The claimed slot sits in `BootRequested` until the claim is handed
    /// to [`activate`](Self::activate); dropping the claim releases it.
    /// Returns `None` when every slot is in use.
    pub fn get_available_thread(&self) -> Option<ThreadClaim> {
        for from in [SlotState::Inactive, SlotState::Reserved] {
            for slot in self.slots() {
                match slot.claim_from(from) {
                    Ok(true) => {
                        debug!(slot = slot.index(), from = %from, "claimed thread");
                        return Some(ThreadClaim::new(slot.clone(), from));
                    }
                    Ok(false) => {}
                    Err(e) => error!(slot = slot.index(), error = %e, "claim rejected"),
                }
            }
        }
        debug!("no inactive or reserved thread found");
        None
    }

    /// Boot a claimed slot for `target` and wait until it is Ready.
    pub fn activate(
        &self,
        claim: ThreadClaim,
        target: SlotTarget,
    ) -> PoolResult<Arc<ThreadSlot>> {
        let slot = claim.into_slot();
        self.activate_claimed(&slot, target)?;
        Ok(slot)
    }

    /// Claim, boot, and wait for one more thread.
    ///
    /// Fails with [`PoolError::MaxThreadsReached`] when nothing can be
    /// claimed; the caller keeps running on existing capacity.
    pub fn add_thread(&self, target: SlotTarget) -> PoolResult<Arc<ThreadSlot>> {
        if !self.is_ready() {
            return Err(PoolError::NotReady(self.state().name()));
        }
        let claim = self
            .get_available_thread()
            .ok_or(PoolError::MaxThreadsReached)?;
        let slot = self.activate(claim, target.clone())?;
        debug!(slot = slot.index(), target = %target, "thread added");
        Ok(slot)
    }

    /// Park a Ready slot. Returns `false` if it was not Ready.
    pub fn deactivate(&self, slot: &ThreadSlot) -> PoolResult<bool> {
        slot.deactivate()
    }

    /// Tear one slot down and return it to Reserved while the pool keeps
    /// running.
    pub fn stop_slot(&self, index: usize) -> PoolResult<()> {
        if !self.is_ready() {
            return Err(PoolError::NotReady(self.state().name()));
        }
        let slot = self.slot(index).ok_or(PoolError::UnknownSlot(index))?;
        debug!(slot = index, "stopping thread");
        slot.stop()
    }

    fn activate_slot(&self, slot: &Arc<ThreadSlot>, target: SlotTarget) -> PoolResult<()> {
        if !slot.claim_from(SlotState::Reserved)? {
            return Err(PoolError::BootFailed {
                slot: slot.index(),
                reason: format!("thread is {}, not reserved", slot.state()),
            });
        }
        self.activate_claimed(slot, target)
    }

    fn activate_claimed(&self, slot: &Arc<ThreadSlot>, target: SlotTarget) -> PoolResult<()> {
        slot.boot(self.runtime.clone(), target)?;
        match slot.wait_for(&[
            SlotState::Ready,
            SlotState::Reserved,
            SlotState::ShuttingDown,
            SlotState::Done,
        ]) {
            SlotState::Ready => Ok(()),
            state => Err(PoolError::BootFailed {
                slot: slot.index(),
                reason: slot
                    .last_error()
                    .unwrap_or_else(|| format!("thread ended up {state}")),
            }),
        }
    }

    /// Shut the pool down. Safe to call more than once.
    ///
    /// Convergence is "every slot terminal": once all shutdowns finish
    /// the coordinator is Done and nothing else is awaited.
    pub fn drain(&self) {
        match self.state() {
            CoordinatorState::Ready => {}
            CoordinatorState::Uninitialized => {
                let _ = self.transition(CoordinatorState::Uninitialized, CoordinatorState::Done);
                self.done.close();
                return;
            }
            CoordinatorState::Starting => {
                // start() sees the closed signal and drains once slots settle.
                debug!("drain requested while starting");
                self.done.close();
                if !self.is_ready() {
                    return;
                }
            }
            state => {
                debug!(state = %state, "drain skipped");
                return;
            }
        }
        if !matches!(
            self.transition(CoordinatorState::Ready, CoordinatorState::ShuttingDown),
            Ok(true)
        ) {
            return;
        }

        debug!("draining threads");
        self.done.close();

        std::thread::scope(|scope| {
            for slot in self.slots() {
                match slot.compare_and_swap(SlotState::Reserved, SlotState::Done) {
                    Ok(true) => {
                        debug!(slot = slot.index(), "reserved thread marked as done");
                        continue;
                    }
                    Ok(false) => {}
                    Err(e) => {
                        error!(slot = slot.index(), error = %e, "unexpected transition failure")
                    }
                }
                scope.spawn(move || {
                    debug!(slot = slot.index(), "shutting down thread");
                    match slot.shutdown() {
                        Ok(()) => debug!(slot = slot.index(), "thread shut down"),
                        Err(e) => error!(slot = slot.index(), error = %e, "thread shutdown failed"),
                    }
                });
            }
        });

        if let Err(e) = self.transition(CoordinatorState::ShuttingDown, CoordinatorState::Done) {
            error!(error = %e, "coordinator finished draining in unexpected state");
        }
        info!(threads = self.slots().len(), "all threads drained");
    }

    fn transition(&self, from: CoordinatorState, to: CoordinatorState) -> PoolResult<bool> {
        self.state
            .compare_and_swap(from, to)
            .map_err(|e| PoolError::InvalidTransition {
                slot: None,
                from: e.from,
                to: e.to,
            })
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        if self.is_ready() {
            warn!("coordinator dropped without draining; draining now");
            self.drain();
        }
    }
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("state", &self.state())
            .field("min_threads", &self.min_threads())
            .field("max_threads", &self.max_threads())
            .field("slots", &self.slot_counts())
            .finish()
    }
}
