//! End-to-end scaling scenarios.
//!
//! Starts a coordinator on the simulated runtime, spawns both scaling
//! loops, and feeds them stall signals the way the dispatch layer would.

use std::sync::Arc;
use std::time::{Duration, Instant};

use threadgrid_autoscale::*;
use threadgrid_core::{MaxThreads, PoolSettings, ScalingSettings};
use threadgrid_cpu::FixedCpuProber;
use threadgrid_pool::{Coordinator, SlotState, WorkerDefinition, WorkerKey, WorkerRegistry};
use threadgrid_runtime::{RuntimeOverrides, SimulatedRuntime};

fn ms(n: u64) -> Duration {
    Duration::from_millis(n)
}

struct Pool {
    runtime: Arc<SimulatedRuntime>,
    prober: Arc<FixedCpuProber>,
    workers: Arc<WorkerRegistry>,
    scaler: Arc<AutoScaler>,
    tasks: ScalerTasks,
}

impl Pool {
    fn start(min: usize, max: usize, settings: ScalingSettings) -> Self {
        let runtime = Arc::new(SimulatedRuntime::new());
        let coordinator = Arc::new(Coordinator::new(
            runtime.clone(),
            PoolSettings::new(min, MaxThreads::Fixed(max)),
            RuntimeOverrides::new(),
        ));
        coordinator.start().unwrap();

        let prober = Arc::new(FixedCpuProber::new(0.2));
        let workers = Arc::new(WorkerRegistry::new());
        let scaler = Arc::new(AutoScaler::new(
            coordinator,
            prober.clone(),
            workers.clone(),
            settings,
        ));
        let tasks = scaler.spawn().unwrap();
        Self {
            runtime,
            prober,
            workers,
            scaler,
            tasks,
        }
    }

    fn ready(&self) -> usize {
        self.scaler.coordinator().slot_counts().ready
    }

    /// Poll until `check` holds or `timeout` passes.
    async fn eventually(&self, timeout: Duration, check: impl Fn(&Self) -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if check(self) {
                return true;
            }
            tokio::time::sleep(ms(5)).await;
        }
        check(self)
    }

    async fn shutdown(self) {
        self.scaler.drain_autoscaling().await;
        let coordinator = Arc::clone(self.scaler.coordinator());
        tokio::task::spawn_blocking(move || coordinator.drain())
            .await
            .unwrap();
        self.tasks.join().await;
    }
}

fn fast() -> ScalingSettings {
    ScalingSettings {
        min_stall_time: ms(5),
        cpu_probe_time: ms(10),
        downscale_interval: ms(50),
        max_idle_time: ms(100),
        ..ScalingSettings::default()
    }
}

#[tokio::test]
async fn two_stalls_for_distinct_targets_add_two_threads() {
    let settings = ScalingSettings {
        // Keep the downscale loop out of the way.
        downscale_interval: Duration::from_secs(5),
        max_idle_time: Duration::from_secs(5),
        ..fast()
    };
    let pool = Pool::start(2, 5, settings);
    let mailer = pool
        .workers
        .register(WorkerDefinition::new("mailer", "/app/mailer.worker"));
    let stalls = pool.scaler.stall_sender();

    let for_mailer = StallSignal::for_worker(Instant::now() - ms(50), mailer.key());
    assert!(stalls.try_signal(for_mailer));
    assert!(pool.eventually(Duration::from_secs(5), |p| p.ready() == 3).await);
    assert!(stalls.try_signal(StallSignal::regular(Instant::now() - ms(50))));

    assert!(pool.eventually(Duration::from_secs(5), |p| p.ready() == 4).await);
    let added = pool.scaler.autoscaled_slots().await;
    assert_eq!(added.len(), 2);

    let targets: Vec<String> = added
        .iter()
        .map(|&i| pool.scaler.coordinator().slot(i).unwrap().target().to_string())
        .collect();
    assert_eq!(targets, vec!["worker:mailer", "regular"]);
    assert_eq!(pool.scaler.current_capacity().await.autoscaled, 2);

    pool.shutdown().await;
}

#[tokio::test]
async fn short_stalls_are_debounced_away() {
    let settings = ScalingSettings {
        min_stall_time: ms(50),
        ..fast()
    };
    let pool = Pool::start(1, 4, settings);
    let stalls = pool.scaler.stall_sender();

    for _ in 0..3 {
        stalls.try_signal(StallSignal::regular(Instant::now()));
    }
    tokio::time::sleep(ms(300)).await;

    assert_eq!(pool.runtime.boot_count(), 1);
    assert_eq!(pool.prober.probe_count(), 0);
    assert!(pool.scaler.autoscaled_slots().await.is_empty());
    pool.shutdown().await;
}

#[tokio::test]
async fn pool_without_headroom_never_scales() {
    let pool = Pool::start(2, 2, fast());
    assert!(pool.tasks.is_empty());

    let stalls = pool.scaler.stall_sender();
    for _ in 0..5 {
        stalls.try_signal(StallSignal::regular(Instant::now() - ms(50)));
    }
    tokio::time::sleep(ms(100)).await;

    assert!(pool.scaler.autoscaled_slots().await.is_empty());
    assert_eq!(pool.runtime.boot_count(), 2);
    assert_eq!(pool.prober.probe_count(), 0);
    pool.shutdown().await;
}

#[tokio::test]
async fn busy_cpu_blocks_every_scale_up() {
    let pool = Pool::start(1, 4, fast());
    pool.prober.set_usage(0.9);

    let stalls = pool.scaler.stall_sender();
    for attempt in 1..=4 {
        assert!(stalls.try_signal(StallSignal::regular(Instant::now() - ms(50))));
        assert!(
            pool.eventually(Duration::from_secs(5), |p| p.prober.probe_count() >= attempt)
                .await
        );
    }

    assert_eq!(pool.runtime.boot_count(), 1);
    assert!(pool.scaler.autoscaled_slots().await.is_empty());
    pool.shutdown().await;
}

#[tokio::test]
async fn concurrent_stalls_never_exceed_headroom() {
    let settings = ScalingSettings {
        downscale_interval: Duration::from_secs(5),
        max_idle_time: Duration::from_secs(5),
        ..fast()
    };
    let pool = Pool::start(2, 5, settings);

    let senders: Vec<_> = (0..4)
        .map(|_| {
            let stalls = pool.scaler.stall_sender();
            tokio::spawn(async move {
                for _ in 0..60 {
                    stalls.try_signal(StallSignal::regular(Instant::now() - ms(50)));
                    tokio::time::sleep(ms(2)).await;
                }
            })
        })
        .collect();
    for sender in senders {
        sender.await.unwrap();
    }

    assert!(pool.eventually(Duration::from_secs(5), |p| p.ready() == 5).await);
    tokio::time::sleep(ms(100)).await;

    assert_eq!(pool.scaler.autoscaled_slots().await.len(), 3);
    assert_eq!(pool.ready(), 5);
    assert_eq!(pool.runtime.boot_count(), 5);
    pool.shutdown().await;
}

#[tokio::test]
async fn idle_autoscaled_thread_is_parked_within_a_tick() {
    let pool = Pool::start(1, 3, fast());
    let stalls = pool.scaler.stall_sender();
    stalls.try_signal(StallSignal::regular(Instant::now() - ms(50)));

    assert!(pool.eventually(Duration::from_secs(5), |p| p.ready() == 2).await);
    let added = pool.scaler.autoscaled_slots().await;
    assert_eq!(added.len(), 1);
    let slot = pool.scaler.coordinator().slot(added[0]).unwrap().clone();

    // idle threshold (100ms) plus one tick (50ms), with slack
    assert!(
        pool.eventually(Duration::from_secs(2), |_| slot.is(SlotState::Inactive))
            .await
    );
    assert!(pool.scaler.autoscaled_slots().await.is_empty());
    assert_eq!(pool.runtime.live_slots(), vec![0, added[0]]);
    pool.shutdown().await;
}

#[tokio::test]
async fn busy_autoscaled_thread_is_kept() {
    let pool = Pool::start(1, 2, fast());
    pool.scaler
        .stall_sender()
        .try_signal(StallSignal::regular(Instant::now() - ms(50)));
    assert!(pool.eventually(Duration::from_secs(5), |p| p.ready() == 2).await);

    let slot = pool.scaler.coordinator().slot(1).unwrap().clone();
    slot.mark_busy();
    tokio::time::sleep(ms(300)).await;

    assert!(slot.is(SlotState::Ready));
    assert_eq!(pool.scaler.autoscaled_slots().await, vec![1]);
    pool.shutdown().await;
}

#[tokio::test]
async fn shutdown_stops_loops_and_finalizes_slots() {
    let pool = Pool::start(2, 6, fast());
    let worker = WorkerKey::new("unregistered", "/app/none.worker");
    pool.scaler
        .stall_sender()
        .try_signal(StallSignal::for_worker(Instant::now() - ms(50), worker));
    assert!(pool.eventually(Duration::from_secs(5), |p| p.ready() == 3).await);

    let scaler = Arc::clone(&pool.scaler);
    let runtime = Arc::clone(&pool.runtime);
    tokio::time::timeout(Duration::from_secs(5), pool.shutdown())
        .await
        .expect("scaling loops did not stop on shutdown");

    let counts = scaler.coordinator().slot_counts();
    assert_eq!(counts.done, 6);
    assert!(runtime.live_slots().is_empty());
    // The upscale loop dropped its receiver on exit.
    assert!(scaler.stall_sender().is_closed());
}
