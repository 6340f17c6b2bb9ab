//! AutoScaler — stall-driven scale-up and idle reclamation.
//!
//! Two independent loops share the list of autoscaled slots:
//!
//! - the upscale loop consumes stall signals, debounces them, gates on
//!   coordinator readiness and a CPU probe, then claims and boots one
//!   slot per accepted signal;
//! - the downscale loop wakes on a fixed tick and reclaims autoscaled
//!   slots that have been idle for too long.
//!
//! Both exit as soon as the coordinator's done signal closes.

use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use serde::Serialize;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use threadgrid_core::{
    PoolSettings, ReclaimPolicy, ScalingSettings, compute_max_threads, total_system_memory,
};
use threadgrid_cpu::{CpuProber, ProbeOutcome};
use threadgrid_pool::{
    Coordinator, Lifecycle, PoolError, SlotState, ThreadSlot, WorkerKey, WorkerRegistry,
};

use crate::error::ScaleError;
use crate::stall::{StallSender, StallSignal, stall_channel};

/// Pool capacity as seen by the dispatch layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Capacity {
    pub min_threads: usize,
    pub max_threads: usize,
    /// Slots added by the upscale loop and not yet reclaimed.
    pub autoscaled: usize,
}

impl Capacity {
    /// The capacity a pool with `settings` would start with.
    ///
    /// Without a configured memory budget an `auto` maximum falls back to
    /// twice the minimum, since the runtime's own limit is only known
    /// once it boots.
    pub fn planned(settings: &PoolSettings) -> Self {
        let min_threads = settings.min_threads.max(1);
        let max_threads = compute_max_threads(
            min_threads,
            settings.max_threads,
            settings.memory_budget,
            total_system_memory(),
        );
        Self {
            min_threads,
            max_threads,
            autoscaled: 0,
        }
    }

    /// Whether autoscaling can add any thread at all.
    pub fn scales(&self) -> bool {
        self.max_threads > self.min_threads
    }
}

/// What a single scale-up attempt did.
#[derive(Debug, Clone, PartialEq)]
pub enum ScaleOutcome {
    /// A slot was booted and joined the autoscaled list.
    Added { slot: usize },
    /// The autoscaled list is already at `max_threads - min_threads`.
    AtCapacity,
    /// The coordinator is not Ready.
    NotReady,
    /// The CPU probe reported usage above the ceiling.
    CpuBusy { usage: f64 },
    /// The done signal fired during the probe.
    Interrupted,
    /// No slot could be claimed.
    Exhausted,
    /// The claimed slot failed to boot.
    Failed(String),
}

/// Handles of the running scaling loops.
#[derive(Debug)]
pub struct ScalerTasks {
    handles: Vec<JoinHandle<()>>,
}

impl ScalerTasks {
    /// No loops run when the pool has no room to scale.
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Wait for the loops to exit. They do so once the done signal closes.
    pub async fn join(self) {
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!(error = %e, "scaling loop panicked");
            }
        }
    }
}

pub struct AutoScaler {
    coordinator: Arc<Coordinator>,
    prober: Arc<dyn CpuProber>,
    workers: Arc<WorkerRegistry>,
    settings: ScalingSettings,
    /// Guarded separately from slot state: both loops mutate membership.
    autoscaled: Mutex<Vec<Arc<ThreadSlot>>>,
    stall_tx: StallSender,
    stall_rx: StdMutex<Option<mpsc::Receiver<StallSignal>>>,
}

impl AutoScaler {
    pub fn new(
        coordinator: Arc<Coordinator>,
        prober: Arc<dyn CpuProber>,
        workers: Arc<WorkerRegistry>,
        settings: ScalingSettings,
    ) -> Self {
        let (stall_tx, stall_rx) = stall_channel(settings.stall_queue_capacity);
        Self {
            coordinator,
            prober,
            workers,
            settings,
            autoscaled: Mutex::new(Vec::new()),
            stall_tx,
            stall_rx: StdMutex::new(Some(stall_rx)),
        }
    }

    /// A sender for the dispatch layer.
    pub fn stall_sender(&self) -> StallSender {
        self.stall_tx.clone()
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    pub fn settings(&self) -> &ScalingSettings {
        &self.settings
    }

    /// How many slots the upscale loop may add on top of the warm pool.
    pub fn additional_capacity(&self) -> usize {
        self.coordinator
            .max_threads()
            .saturating_sub(self.coordinator.min_threads())
    }

    /// Start both scaling loops.
    ///
    /// Call after [`Coordinator::start`]. When `max_threads` leaves no
    /// room above `min_threads` no loop is started and stall signals are
    /// dropped by the sender.
    pub fn spawn(self: &Arc<Self>) -> Result<ScalerTasks, ScaleError> {
        if !self.coordinator.is_ready() {
            return Err(PoolError::NotReady(self.coordinator.state().name()).into());
        }
        let stalls = self
            .stall_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(ScaleError::AlreadyRunning)?;

        let max_autoscaled = self.additional_capacity();
        if max_autoscaled == 0 {
            debug!("auto-scaling disabled: max_threads <= min_threads");
            return Ok(ScalerTasks {
                handles: Vec::new(),
            });
        }

        info!(
            max_autoscaled,
            reclaim_policy = ?self.settings.reclaim_policy,
            "auto-scaling initialized"
        );
        let upscale = tokio::spawn(Arc::clone(self).upscale_loop(stalls));
        let downscale = tokio::spawn(Arc::clone(self).downscale_loop());
        Ok(ScalerTasks {
            handles: vec![upscale, downscale],
        })
    }

    async fn upscale_loop(self: Arc<Self>, mut stalls: mpsc::Receiver<StallSignal>) {
        let max_autoscaled = self.additional_capacity();
        let done = self.coordinator.done();
        debug!(max_autoscaled, "upscale loop started");

        loop {
            let scaled = self.autoscaled.lock().await.len();
            if scaled >= max_autoscaled {
                debug!(scaled, "max autoscaled threads reached, waiting");
                tokio::select! {
                    _ = done.closed() => break,
                    _ = tokio::time::sleep(self.settings.downscale_interval) => continue,
                }
            }

            let signal = tokio::select! {
                signal = stalls.recv() => match signal {
                    Some(signal) => signal,
                    None => break,
                },
                _ = done.closed() => break,
            };

            // A young signal only pauses the loop; it never scales on its own.
            let age = signal.age();
            if age < self.settings.min_stall_time {
                debug!(?age, "work item not stalled long enough, dropping signal");
                tokio::select! {
                    _ = done.closed() => break,
                    _ = tokio::time::sleep(self.settings.min_stall_time - age) => {
                        // Signals that queued up meanwhile are dropped too.
                        let mut skipped = 0;
                        while stalls.try_recv().is_ok() {
                            skipped += 1;
                        }
                        if skipped > 0 {
                            debug!(skipped, "dropped signals queued during the stall wait");
                        }
                        continue;
                    }
                }
            }

            let outcome = self.scale_up(signal.target.as_ref()).await;
            debug!(?outcome, "scale-up attempt finished");
        }

        debug!("upscale loop stopped");
    }

    /// Try to add one thread for `target` (a worker, or a regular thread).
    pub async fn scale_up(&self, target: Option<&WorkerKey>) -> ScaleOutcome {
        if !self.coordinator.is_ready() {
            debug!("coordinator not ready, skipping scale-up");
            return ScaleOutcome::NotReady;
        }
        if self.autoscaled.lock().await.len() >= self.additional_capacity() {
            return ScaleOutcome::AtCapacity;
        }

        let probe = self.prober.probe(
            self.settings.cpu_probe_time,
            self.settings.max_cpu_usage,
            self.coordinator.done().subscribe(),
        );
        match probe.await {
            ProbeOutcome::Below { usage } => debug!(usage, "cpu probe passed"),
            ProbeOutcome::Above { usage } => {
                debug!(usage, "cpu usage too high, skipping scale-up");
                return ScaleOutcome::CpuBusy { usage };
            }
            ProbeOutcome::Interrupted => {
                debug!("cpu probe interrupted, skipping scale-up");
                return ScaleOutcome::Interrupted;
            }
        }

        let mut autoscaled = self.autoscaled.lock().await;
        if autoscaled.len() >= self.additional_capacity() {
            return ScaleOutcome::AtCapacity;
        }

        let slot_target = self.workers.resolve(target);
        let coordinator = Arc::clone(&self.coordinator);
        let boot_target = slot_target.clone();
        let added =
            tokio::task::spawn_blocking(move || coordinator.add_thread(boot_target)).await;

        match added {
            Ok(Ok(slot)) => {
                let index = slot.index();
                debug!(slot = index, target = %slot_target, "thread scaled up");
                if !autoscaled.iter().any(|s| Arc::ptr_eq(s, &slot)) {
                    autoscaled.push(slot);
                }
                ScaleOutcome::Added { slot: index }
            }
            Ok(Err(PoolError::MaxThreadsReached)) => {
                warn!(
                    target = %slot_target,
                    "could not increase max_threads, consider raising this limit"
                );
                ScaleOutcome::Exhausted
            }
            Ok(Err(e)) => {
                warn!(target = %slot_target, error = %e, "scale-up failed");
                ScaleOutcome::Failed(e.to_string())
            }
            Err(e) => {
                error!(error = %e, "scale-up task panicked");
                ScaleOutcome::Failed(e.to_string())
            }
        }
    }

    async fn downscale_loop(self: Arc<Self>) {
        let done = self.coordinator.done();
        debug!(interval = ?self.settings.downscale_interval, "downscale loop started");

        loop {
            tokio::select! {
                _ = done.closed() => break,
                _ = tokio::time::sleep(self.settings.downscale_interval) => {
                    self.downscale_tick().await;
                }
            }
        }

        debug!("downscale loop stopped");
    }

    /// One sweep over the autoscaled list. Returns how many slots were
    /// reclaimed.
    ///
    /// Entries that were returned to Reserved elsewhere are dropped from
    /// the list; Ready slots idle for longer than `max_idle_time` are
    /// reclaimed, at most `max_deactivations_per_tick` per sweep.
    pub async fn downscale_tick(&self) -> usize {
        let mut autoscaled = self.autoscaled.lock().await;
        let mut reclaimed = 0;

        for i in (0..autoscaled.len()).rev() {
            let slot = Arc::clone(&autoscaled[i]);

            if slot.is(SlotState::Reserved) {
                autoscaled.remove(i);
                debug!(slot = slot.index(), "reserved thread removed from autoscaled list");
                continue;
            }

            let wait_time = slot.wait_time();
            if reclaimed >= self.settings.max_deactivations_per_tick || wait_time.is_zero() {
                continue;
            }

            if slot.is(SlotState::Ready)
                && wait_time > self.settings.max_idle_time
                && self.reclaim(&slot).await
            {
                reclaimed += 1;
                autoscaled.remove(i);
            }
        }

        if reclaimed > 0 {
            debug!(reclaimed, remaining = autoscaled.len(), "downscale tick finished");
        }
        reclaimed
    }

    async fn reclaim(&self, slot: &Arc<ThreadSlot>) -> bool {
        let index = slot.index();
        match self.settings.reclaim_policy {
            ReclaimPolicy::Park => match self.coordinator.deactivate(slot) {
                Ok(parked) => {
                    if parked {
                        debug!(slot = index, "idle thread parked");
                    }
                    parked
                }
                Err(e) => {
                    error!(slot = index, error = %e, "failed to park idle thread");
                    false
                }
            },
            ReclaimPolicy::Stop => {
                let coordinator = Arc::clone(&self.coordinator);
                match tokio::task::spawn_blocking(move || coordinator.stop_slot(index)).await {
                    Ok(Ok(())) => {
                        debug!(slot = index, "idle thread stopped");
                        true
                    }
                    Ok(Err(e)) => {
                        warn!(slot = index, error = %e, "failed to stop idle thread");
                        false
                    }
                    Err(e) => {
                        error!(slot = index, error = %e, "stop task panicked");
                        false
                    }
                }
            }
        }
    }

    pub async fn current_capacity(&self) -> Capacity {
        Capacity {
            min_threads: self.coordinator.min_threads(),
            max_threads: self.coordinator.max_threads(),
            autoscaled: self.autoscaled.lock().await.len(),
        }
    }

    /// Indices of the autoscaled slots, in the order they were added.
    pub async fn autoscaled_slots(&self) -> Vec<usize> {
        self.autoscaled
            .lock()
            .await
            .iter()
            .map(|slot| slot.index())
            .collect()
    }

    /// Log the autoscaled count ahead of a coordinator drain.
    pub async fn drain_autoscaling(&self) -> usize {
        let autoscaled = self.autoscaled.lock().await.len();
        debug!(autoscaled, "shutting down autoscaling");
        autoscaled
    }
}

impl std::fmt::Debug for AutoScaler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AutoScaler")
            .field("coordinator", &self.coordinator)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}
