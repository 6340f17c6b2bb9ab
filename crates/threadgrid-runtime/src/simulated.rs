//! SimulatedRuntime — an in-process stand-in for the embedded runtime.
//!
//! Tracks which slots hold a live instance and which OS thread booted
//! each one, so tests can assert the one-instance-per-thread rule and
//! count boots and shutdowns. Boot latency, boot failures, and the
//! reported memory limit are configurable.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread::ThreadId;
use std::time::Duration;

use anyhow::bail;
use tracing::debug;

use crate::{EmbeddedRuntime, RuntimeOverrides};

#[derive(Default)]
struct Instances {
    /// slot → OS thread that booted it.
    live: HashMap<usize, ThreadId>,
    failing: HashSet<usize>,
    primed: Option<RuntimeOverrides>,
}

/// A runtime whose instances are bookkeeping entries.
pub struct SimulatedRuntime {
    instances: Mutex<Instances>,
    boot_delay: Duration,
    memory_limit: Option<i64>,
    fail_priming: bool,
    boots: AtomicUsize,
    shutdowns: AtomicUsize,
}

impl SimulatedRuntime {
    pub fn new() -> Self {
        Self {
            instances: Mutex::new(Instances::default()),
            boot_delay: Duration::ZERO,
            memory_limit: None,
            fail_priming: false,
            boots: AtomicUsize::new(0),
            shutdowns: AtomicUsize::new(0),
        }
    }

    /// Sleep this long inside every `boot`.
    pub fn with_boot_delay(mut self, delay: Duration) -> Self {
        self.boot_delay = delay;
        self
    }

    /// Report this per-thread memory limit.
    pub fn with_memory_limit(mut self, bytes: i64) -> Self {
        self.memory_limit = Some(bytes);
        self
    }

    /// Make `prime_environment` fail.
    pub fn with_failing_priming(mut self) -> Self {
        self.fail_priming = true;
        self
    }

    /// Make every boot of `slot` fail until [`clear_failures`](Self::clear_failures).
    pub fn fail_boot_for(&self, slot: usize) {
        self.lock().failing.insert(slot);
    }

    pub fn clear_failures(&self) {
        self.lock().failing.clear();
    }

    /// Successful boots so far.
    pub fn boot_count(&self) -> usize {
        self.boots.load(Ordering::SeqCst)
    }

    pub fn shutdown_count(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }

    /// Slots that currently hold a booted instance, sorted.
    pub fn live_slots(&self) -> Vec<usize> {
        let mut slots: Vec<usize> = self.lock().live.keys().copied().collect();
        slots.sort_unstable();
        slots
    }

    /// The overrides received by `prime_environment`, if it ran.
    pub fn primed_overrides(&self) -> Option<RuntimeOverrides> {
        self.lock().primed.clone()
    }

    fn lock(&self) -> MutexGuard<'_, Instances> {
        self.instances.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for SimulatedRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl EmbeddedRuntime for SimulatedRuntime {
    fn prime_environment(&self, overrides: &RuntimeOverrides) -> anyhow::Result<()> {
        if self.fail_priming {
            bail!("simulated environment priming failure");
        }
        debug!(entries = overrides.len(), "simulated runtime primed");
        self.lock().primed = Some(overrides.clone());
        Ok(())
    }

    fn boot(&self, slot: usize) -> anyhow::Result<()> {
        if !self.boot_delay.is_zero() {
            std::thread::sleep(self.boot_delay);
        }

        let mut instances = self.lock();
        if instances.failing.contains(&slot) {
            bail!("simulated boot failure for slot {slot}");
        }
        let thread = std::thread::current().id();
        if let Some(owner) = instances.live.get(&slot) {
            bail!("slot {slot} already holds an instance booted on {owner:?}");
        }
        instances.live.insert(slot, thread);
        drop(instances);

        self.boots.fetch_add(1, Ordering::SeqCst);
        debug!(slot, "simulated instance booted");
        Ok(())
    }

    fn shutdown(&self, slot: usize) {
        let removed = self.lock().live.remove(&slot);
        if removed.is_some() {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
            debug!(slot, "simulated instance shut down");
        }
    }

    fn memory_limit(&self) -> Option<i64> {
        self.memory_limit
    }
}
