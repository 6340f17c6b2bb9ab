//! Stall signals from the dispatch layer.

use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::debug;

use threadgrid_pool::WorkerKey;

/// A work item that found no free thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StallSignal {
    /// When the work item was queued.
    pub arrived_at: Instant,
    /// The worker the item targets; `None` for a regular request.
    pub target: Option<WorkerKey>,
}

impl StallSignal {
    pub fn regular(arrived_at: Instant) -> Self {
        Self {
            arrived_at,
            target: None,
        }
    }

    pub fn for_worker(arrived_at: Instant, key: WorkerKey) -> Self {
        Self {
            arrived_at,
            target: Some(key),
        }
    }

    /// How long the item has been waiting.
    pub fn age(&self) -> Duration {
        self.arrived_at.elapsed()
    }
}

/// Sending half of the stall queue, held by the dispatch layer.
///
/// Never blocks: when the queue is full or the autoscaler is gone the
/// signal is dropped and the work item keeps waiting on existing threads.
#[derive(Debug, Clone)]
pub struct StallSender {
    tx: mpsc::Sender<StallSignal>,
}

impl StallSender {
    /// Returns `false` if the signal was dropped.
    pub fn try_signal(&self, signal: StallSignal) -> bool {
        match self.tx.try_send(signal) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!("stall queue full, dropping signal");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Whether the upscale loop has stopped listening.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Bounded stall queue.
pub fn stall_channel(capacity: usize) -> (StallSender, mpsc::Receiver<StallSignal>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (StallSender { tx }, rx)
}
