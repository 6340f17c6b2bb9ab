//! CPU probe implementations.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tracing::debug;

/// Future returned by [`CpuProber::probe`].
pub type ProbeFuture<'a> = Pin<Box<dyn Future<Output = ProbeOutcome> + Send + 'a>>;

/// Result of a single CPU probe.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ProbeOutcome {
    /// Usage over the window stayed at or below the ceiling.
    Below { usage: f64 },
    /// Usage over the window exceeded the ceiling.
    Above { usage: f64 },
    /// The done signal fired before the window elapsed.
    Interrupted,
}

impl ProbeOutcome {
    /// Whether a scale-up may proceed.
    ///
    /// An interrupted probe declines; it is not an error.
    pub fn allows_scaling(&self) -> bool {
        matches!(self, ProbeOutcome::Below { .. })
    }

    fn classify(usage: f64, ceiling: f64) -> Self {
        if usage > ceiling {
            ProbeOutcome::Above { usage }
        } else {
            ProbeOutcome::Below { usage }
        }
    }
}

/// Answers "is the system below a CPU ceiling over a sampling window?".
///
/// `done` is the process-wide shutdown signal (`true` once closed); a
/// probe must return [`ProbeOutcome::Interrupted`] promptly when it fires.
pub trait CpuProber: Send + Sync {
    fn probe(
        &self,
        window: Duration,
        ceiling: f64,
        done: watch::Receiver<bool>,
    ) -> ProbeFuture<'_>;
}

/// Sleep for `window` unless `done` closes first.
///
/// Returns `false` if interrupted.
async fn wait_window(window: Duration, mut done: watch::Receiver<bool>) -> bool {
    if *done.borrow() {
        return false;
    }
    tokio::select! {
        _ = tokio::time::sleep(window) => true,
        _ = done.wait_for(|closed| *closed) => false,
    }
}

/// Measures this process's CPU time against wall time across all CPUs.
#[derive(Debug, Clone)]
pub struct ProcessCpuProber {
    cpus: usize,
}

impl ProcessCpuProber {
    pub fn new() -> Self {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self { cpus }
    }

    /// Number of CPUs usage is normalized against.
    pub fn cpus(&self) -> usize {
        self.cpus
    }
}

impl Default for ProcessCpuProber {
    fn default() -> Self {
        Self::new()
    }
}

impl CpuProber for ProcessCpuProber {
    fn probe(
        &self,
        window: Duration,
        ceiling: f64,
        done: watch::Receiver<bool>,
    ) -> ProbeFuture<'_> {
        Box::pin(async move {
            let wall_start = Instant::now();
            let cpu_start = process_cpu_time();

            if !wait_window(window, done).await {
                debug!("cpu probe interrupted by shutdown");
                return ProbeOutcome::Interrupted;
            }

            let (Some(start), Some(end)) = (cpu_start, process_cpu_time()) else {
                // No process clock on this platform; never block scaling.
                return ProbeOutcome::Below { usage: 0.0 };
            };

            let wall = wall_start.elapsed().as_secs_f64() * self.cpus as f64;
            let cpu = end.saturating_sub(start).as_secs_f64();
            let usage = if wall > 0.0 { cpu / wall } else { 0.0 };

            let outcome = ProbeOutcome::classify(usage, ceiling);
            debug!(usage, ceiling, allows = outcome.allows_scaling(), "cpu probe finished");
            outcome
        })
    }
}

/// CPU time consumed by this process so far.
#[cfg(unix)]
fn process_cpu_time() -> Option<Duration> {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: `ts` is a valid, writable timespec for the duration of the call.
    let rc = unsafe { libc::clock_gettime(libc::CLOCK_PROCESS_CPUTIME_ID, &mut ts) };
    if rc != 0 {
        return None;
    }
    Some(Duration::new(ts.tv_sec as u64, ts.tv_nsec as u32))
}

#[cfg(not(unix))]
fn process_cpu_time() -> Option<Duration> {
    None
}

/// A prober reporting a settable usage value.
///
/// Still waits out the sampling window (and honors `done`) so timing
/// behaves like the real prober.
#[derive(Debug)]
pub struct FixedCpuProber {
    usage_bits: AtomicU64,
    probes: AtomicUsize,
}

impl FixedCpuProber {
    pub fn new(usage: f64) -> Self {
        Self {
            usage_bits: AtomicU64::new(usage.to_bits()),
            probes: AtomicUsize::new(0),
        }
    }

    pub fn set_usage(&self, usage: f64) {
        self.usage_bits.store(usage.to_bits(), Ordering::SeqCst);
    }

    pub fn usage(&self) -> f64 {
        f64::from_bits(self.usage_bits.load(Ordering::SeqCst))
    }

    /// Probes started so far.
    pub fn probe_count(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }
}

impl CpuProber for FixedCpuProber {
    fn probe(
        &self,
        window: Duration,
        ceiling: f64,
        done: watch::Receiver<bool>,
    ) -> ProbeFuture<'_> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        Box::pin(async move {
            if !wait_window(window, done).await {
                return ProbeOutcome::Interrupted;
            }
            ProbeOutcome::classify(self.usage(), ceiling)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_gates_scaling() {
        assert!(ProbeOutcome::Below { usage: 0.2 }.allows_scaling());
        assert!(!ProbeOutcome::Above { usage: 0.9 }.allows_scaling());
        assert!(!ProbeOutcome::Interrupted.allows_scaling());
    }

    #[test]
    fn usage_equal_to_ceiling_is_below() {
        assert_eq!(
            ProbeOutcome::classify(0.8, 0.8),
            ProbeOutcome::Below { usage: 0.8 }
        );
        assert_eq!(
            ProbeOutcome::classify(0.81, 0.8),
            ProbeOutcome::Above { usage: 0.81 }
        );
    }

    #[tokio::test]
    async fn fixed_prober_reports_configured_usage() {
        let (_tx, rx) = watch::channel(false);
        let prober = FixedCpuProber::new(0.2);

        let outcome = prober.probe(Duration::from_millis(5), 0.8, rx.clone()).await;
        assert_eq!(outcome, ProbeOutcome::Below { usage: 0.2 });

        prober.set_usage(0.95);
        let outcome = prober.probe(Duration::from_millis(5), 0.8, rx).await;
        assert_eq!(outcome, ProbeOutcome::Above { usage: 0.95 });
        assert_eq!(prober.probe_count(), 2);
    }

    #[tokio::test]
    async fn probe_is_interrupted_by_done_signal() {
        let (tx, rx) = watch::channel(false);
        let prober = FixedCpuProber::new(0.1);

        let started = Instant::now();
        let handle = tokio::spawn(async move {
            prober.probe(Duration::from_secs(30), 0.8, rx).await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send(true).unwrap();

        assert_eq!(handle.await.unwrap(), ProbeOutcome::Interrupted);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn probe_after_done_returns_immediately() {
        let (_tx, rx) = watch::channel(true);
        let prober = ProcessCpuProber::new();
        let outcome = prober.probe(Duration::from_secs(30), 0.8, rx).await;
        assert_eq!(outcome, ProbeOutcome::Interrupted);
    }

    #[tokio::test]
    async fn process_prober_measures_an_idle_process() {
        let (_tx, rx) = watch::channel(false);
        let prober = ProcessCpuProber::new();
        assert!(prober.cpus() >= 1);

        // The test process is mostly sleeping, so a ceiling of 100% must pass.
        let outcome = prober.probe(Duration::from_millis(50), 1.0, rx).await;
        assert!(outcome.allows_scaling(), "unexpected outcome {outcome:?}");
    }

    #[cfg(unix)]
    #[test]
    fn process_cpu_time_is_monotonic() {
        let a = process_cpu_time().unwrap();
        let mut x = 0u64;
        for i in 0..1_000_000u64 {
            x = x.wrapping_add(i * i);
        }
        std::hint::black_box(x);
        let b = process_cpu_time().unwrap();
        assert!(b >= a);
    }
}
