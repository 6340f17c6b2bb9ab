//! `threadgridd run` — pool lifecycle from startup to drain.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use threadgrid_autoscale::{AutoScaler, StallSender, StallSignal};
use threadgrid_core::Settings;
use threadgrid_cpu::{CpuProber, ProcessCpuProber};
use threadgrid_pool::{Coordinator, DoneSignal, WorkerRegistry};
use threadgrid_runtime::{RuntimeOverrides, SimulatedRuntime};

pub async fn run_pool(
    settings: Settings,
    synthetic_stall_interval: Option<Duration>,
    boot_delay: Option<Duration>,
) -> anyhow::Result<()> {
    info!("threadgrid daemon starting");

    // ── Runtime + coordinator ──────────────────────────────────

    let runtime = Arc::new(SimulatedRuntime::new().with_boot_delay(boot_delay.unwrap_or_default()));
    let overrides = RuntimeOverrides::from_settings(&settings.runtime);
    let coordinator = Arc::new(Coordinator::new(runtime, settings.pool.clone(), overrides));

    let starting = Arc::clone(&coordinator);
    tokio::task::spawn_blocking(move || starting.start()).await??;
    info!(
        min_threads = coordinator.min_threads(),
        max_threads = coordinator.max_threads(),
        "thread pool ready"
    );

    // ── Scaling loops ──────────────────────────────────────────

    let prober: Arc<dyn CpuProber> = Arc::new(ProcessCpuProber::new());
    let workers = Arc::new(WorkerRegistry::new());
    let scaler = Arc::new(AutoScaler::new(
        Arc::clone(&coordinator),
        prober,
        workers,
        settings.scaling.clone(),
    ));
    let tasks = scaler.spawn()?;

    let synthetic = synthetic_stall_interval.map(|every| {
        info!(interval = ?every, "synthetic stall signals enabled");
        tokio::spawn(synthetic_stalls(
            scaler.stall_sender(),
            every,
            settings.scaling.min_stall_time,
            coordinator.done().clone(),
        ))
    });

    // ── Shutdown ───────────────────────────────────────────────

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");

    let capacity = scaler.current_capacity().await;
    info!(
        min_threads = capacity.min_threads,
        max_threads = capacity.max_threads,
        autoscaled = capacity.autoscaled,
        "draining thread pool"
    );
    scaler.drain_autoscaling().await;

    let draining = Arc::clone(&coordinator);
    tokio::task::spawn_blocking(move || draining.drain()).await?;

    tasks.join().await;
    if let Some(handle) = synthetic {
        let _ = handle.await;
    }

    info!("threadgrid daemon stopped");
    Ok(())
}

/// Stand-in for a dispatch layer that keeps running out of threads.
///
/// Each signal reports a work item that has already waited `stalled_for`.
async fn synthetic_stalls(
    stalls: StallSender,
    every: Duration,
    stalled_for: Duration,
    done: DoneSignal,
) {
    let mut ticker = tokio::time::interval(every);
    loop {
        tokio::select! {
            _ = done.closed() => break,
            _ = ticker.tick() => {
                let now = Instant::now();
                let arrived_at = now.checked_sub(stalled_for).unwrap_or(now);
                if !stalls.try_signal(StallSignal::regular(arrived_at)) {
                    debug!("synthetic stall dropped");
                }
            }
        }
    }
}
