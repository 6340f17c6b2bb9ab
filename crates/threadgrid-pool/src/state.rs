//! State machines for slots and the coordinator.
//!
//! Every transition goes through [`StateCell::compare_and_swap`], which
//! checks the pair against the machine's transition table before
//! comparing against the current value. Illegal pairs are rejected with
//! an error instead of being applied; a legal pair that loses the race
//! simply returns `false`.
//!
//! ```text
//! Reserved      ──claim──────────────▶ BootRequested
//! Reserved      ──drain──────────────▶ Done
//! Inactive      ──reactivate─────────▶ BootRequested
//! Inactive      ──drain / stop───────▶ ShuttingDown
//! BootRequested ──boot ok────────────▶ Ready
//! BootRequested ──boot failed────────▶ Reserved
//! BootRequested ──claim released─────▶ Reserved / Inactive
//! Ready         ──park───────────────▶ Inactive
//! Ready         ──drain / stop───────▶ ShuttingDown
//! ShuttingDown  ──drain──────────────▶ Done
//! ShuttingDown  ──stop───────────────▶ Reserved
//! ```

use std::fmt;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// A state type with a fixed transition table.
pub trait Lifecycle: Copy + Eq + fmt::Debug + Send + 'static {
    fn can_transition_to(self, next: Self) -> bool;

    fn name(self) -> &'static str;
}

/// State of a single thread slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotState {
    /// Allocated, never booted (or stopped); placeholder capacity.
    Reserved,
    /// Claimed; the runtime instance is being initialized.
    BootRequested,
    /// Runtime instance initialized and able to execute work.
    Ready,
    /// Parked; the instance stays booted but takes no work.
    Inactive,
    /// Graceful teardown in progress.
    ShuttingDown,
    /// Terminal for the rest of the process.
    Done,
}

impl Lifecycle for SlotState {
    fn can_transition_to(self, next: Self) -> bool {
        use SlotState::*;
        matches!(
            (self, next),
            (Reserved, BootRequested)
                | (Reserved, Done)
                | (Inactive, BootRequested)
                | (Inactive, ShuttingDown)
                | (BootRequested, Ready)
                | (BootRequested, Reserved)
                | (BootRequested, Inactive)
                | (Ready, Inactive)
                | (Ready, ShuttingDown)
                | (ShuttingDown, Done)
                | (ShuttingDown, Reserved)
        )
    }

    fn name(self) -> &'static str {
        match self {
            SlotState::Reserved => "reserved",
            SlotState::BootRequested => "boot requested",
            SlotState::Ready => "ready",
            SlotState::Inactive => "inactive",
            SlotState::ShuttingDown => "shutting down",
            SlotState::Done => "done",
        }
    }
}

impl fmt::Display for SlotState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Process-level lifecycle of the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CoordinatorState {
    Uninitialized,
    Starting,
    Ready,
    ShuttingDown,
    Done,
}

impl Lifecycle for CoordinatorState {
    fn can_transition_to(self, next: Self) -> bool {
        use CoordinatorState::*;
        matches!(
            (self, next),
            (Uninitialized, Starting)
                | (Uninitialized, Done)
                | (Starting, Ready)
                | (Starting, Done)
                | (Ready, ShuttingDown)
                | (ShuttingDown, Done)
        )
    }

    fn name(self) -> &'static str {
        match self {
            CoordinatorState::Uninitialized => "uninitialized",
            CoordinatorState::Starting => "starting",
            CoordinatorState::Ready => "ready",
            CoordinatorState::ShuttingDown => "shutting down",
            CoordinatorState::Done => "done",
        }
    }
}

impl fmt::Display for CoordinatorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A transition that is not in the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IllegalTransition {
    pub from: &'static str,
    pub to: &'static str,
}

struct Current<S> {
    state: S,
    entered_at: Instant,
}

/// A state value with linearizable compare-and-swap and blocking waits.
pub struct StateCell<S: Lifecycle> {
    current: Mutex<Current<S>>,
    changed: Condvar,
}

impl<S: Lifecycle> StateCell<S> {
    pub fn new(initial: S) -> Self {
        Self {
            current: Mutex::new(Current {
                state: initial,
                entered_at: Instant::now(),
            }),
            changed: Condvar::new(),
        }
    }

    pub fn get(&self) -> S {
        self.lock().state
    }

    pub fn is(&self, state: S) -> bool {
        self.get() == state
    }

    /// When the current state was entered.
    pub fn entered_at(&self) -> Instant {
        self.lock().entered_at
    }

    /// Move from `from` to `to` if the cell currently holds `from`.
    ///
    /// Exactly one of several concurrent callers with the same `from`
    /// wins. Returns `Ok(false)` if the current state differs.
    pub fn compare_and_swap(&self, from: S, to: S) -> Result<bool, IllegalTransition> {
        if !from.can_transition_to(to) {
            return Err(IllegalTransition {
                from: from.name(),
                to: to.name(),
            });
        }

        let mut current = self.lock();
        if current.state != from {
            return Ok(false);
        }
        current.state = to;
        current.entered_at = Instant::now();
        drop(current);

        self.changed.notify_all();
        Ok(true)
    }

    /// Block until the state is one of `states`; returns the state seen.
    ///
    /// There is no timeout. Callers rely on every in-flight transition
    /// running to completion.
    pub fn wait_for(&self, states: &[S]) -> S {
        let current = self.lock();
        let current = self
            .changed
            .wait_while(current, |c| !states.contains(&c.state))
            .unwrap_or_else(PoisonError::into_inner);
        current.state
    }

    /// Like [`wait_for`](Self::wait_for) but gives up after `timeout`.
    pub fn wait_for_timeout(&self, states: &[S], timeout: Duration) -> Option<S> {
        let current = self.lock();
        let (current, _) = self
            .changed
            .wait_timeout_while(current, timeout, |c| !states.contains(&c.state))
            .unwrap_or_else(PoisonError::into_inner);
        states.contains(&current.state).then_some(current.state)
    }

    /// Block until the state is no longer `state`; returns the new state.
    pub fn wait_while(&self, state: S) -> S {
        let current = self.lock();
        let current = self
            .changed
            .wait_while(current, |c| c.state == state)
            .unwrap_or_else(PoisonError::into_inner);
        current.state
    }

    fn lock(&self) -> MutexGuard<'_, Current<S>> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<S: Lifecycle> fmt::Debug for StateCell<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("StateCell").field(&self.get()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    const ALL_SLOT_STATES: [SlotState; 6] = [
        SlotState::Reserved,
        SlotState::BootRequested,
        SlotState::Ready,
        SlotState::Inactive,
        SlotState::ShuttingDown,
        SlotState::Done,
    ];

    #[test]
    fn slot_transition_table() {
        use SlotState::*;
        let allowed = [
            (Reserved, BootRequested),
            (Reserved, Done),
            (Inactive, BootRequested),
            (Inactive, ShuttingDown),
            (BootRequested, Ready),
            (BootRequested, Reserved),
            (BootRequested, Inactive),
            (Ready, Inactive),
            (Ready, ShuttingDown),
            (ShuttingDown, Done),
            (ShuttingDown, Reserved),
        ];
        for from in ALL_SLOT_STATES {
            for to in ALL_SLOT_STATES {
                assert_eq!(
                    from.can_transition_to(to),
                    allowed.contains(&(from, to)),
                    "{from} -> {to}"
                );
            }
        }
    }

    #[test]
    fn done_is_terminal() {
        for to in ALL_SLOT_STATES {
            assert!(!SlotState::Done.can_transition_to(to));
        }
    }

    #[test]
    fn reserved_never_jumps_to_ready() {
        assert!(!SlotState::Reserved.can_transition_to(SlotState::Ready));
        assert!(!SlotState::Inactive.can_transition_to(SlotState::Ready));
    }

    #[test]
    fn coordinator_transition_table() {
        use CoordinatorState::*;
        assert!(Uninitialized.can_transition_to(Starting));
        assert!(Starting.can_transition_to(Ready));
        assert!(Ready.can_transition_to(ShuttingDown));
        assert!(ShuttingDown.can_transition_to(Done));
        assert!(!Done.can_transition_to(Ready));
        assert!(!Ready.can_transition_to(Starting));
        assert!(!ShuttingDown.can_transition_to(Ready));
    }

    #[test]
    fn compare_and_swap_applies_legal_transition() {
        let cell = StateCell::new(SlotState::Reserved);
        assert_eq!(
            cell.compare_and_swap(SlotState::Reserved, SlotState::BootRequested),
            Ok(true)
        );
        assert!(cell.is(SlotState::BootRequested));
    }

    #[test]
    fn compare_and_swap_loses_when_state_differs() {
        let cell = StateCell::new(SlotState::Ready);
        assert_eq!(
            cell.compare_and_swap(SlotState::Reserved, SlotState::BootRequested),
            Ok(false)
        );
        assert!(cell.is(SlotState::Ready));
    }

    #[test]
    fn compare_and_swap_rejects_illegal_pair() {
        let cell = StateCell::new(SlotState::Reserved);
        let err = cell
            .compare_and_swap(SlotState::Reserved, SlotState::Ready)
            .unwrap_err();
        assert_eq!(err.from, "reserved");
        assert_eq!(err.to, "ready");
        assert!(cell.is(SlotState::Reserved));
    }

    #[test]
    fn exactly_one_contender_wins() {
        let cell = Arc::new(StateCell::new(SlotState::Reserved));
        let winners = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let cell = cell.clone();
                let winners = winners.clone();
                thread::spawn(move || {
                    if cell
                        .compare_and_swap(SlotState::Reserved, SlotState::BootRequested)
                        .unwrap()
                    {
                        winners.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(winners.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn wait_for_observes_transition_from_other_thread() {
        let cell = Arc::new(StateCell::new(SlotState::BootRequested));
        let waiter = {
            let cell = cell.clone();
            thread::spawn(move || cell.wait_for(&[SlotState::Ready, SlotState::Reserved]))
        };

        thread::sleep(Duration::from_millis(20));
        cell.compare_and_swap(SlotState::BootRequested, SlotState::Ready)
            .unwrap();

        assert_eq!(waiter.join().unwrap(), SlotState::Ready);
    }

    #[test]
    fn wait_for_returns_immediately_when_already_there() {
        let cell = StateCell::new(SlotState::Done);
        assert_eq!(cell.wait_for(&[SlotState::Done]), SlotState::Done);
    }

    #[test]
    fn wait_for_timeout_gives_up() {
        let cell = StateCell::new(SlotState::Reserved);
        assert_eq!(
            cell.wait_for_timeout(&[SlotState::Ready], Duration::from_millis(10)),
            None
        );
    }

    #[test]
    fn wait_while_returns_next_state() {
        let cell = Arc::new(StateCell::new(SlotState::ShuttingDown));
        let waiter = {
            let cell = cell.clone();
            thread::spawn(move || cell.wait_while(SlotState::ShuttingDown))
        };
        thread::sleep(Duration::from_millis(10));
        cell.compare_and_swap(SlotState::ShuttingDown, SlotState::Done)
            .unwrap();
        assert_eq!(waiter.join().unwrap(), SlotState::Done);
    }

    #[test]
    fn entered_at_advances_on_transition() {
        let cell = StateCell::new(SlotState::Ready);
        let before = cell.entered_at();
        thread::sleep(Duration::from_millis(2));
        cell.compare_and_swap(SlotState::Ready, SlotState::Inactive)
            .unwrap();
        assert!(cell.entered_at() > before);
    }
}
