//! Pool error types.

use thiserror::Error;

/// Errors that can occur while starting, scaling, or draining the pool.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("failed to prime the runtime environment: {0}")]
    EnvironmentPriming(#[source] anyhow::Error),

    #[error("failed to boot the first thread: {0}")]
    MainThreadCreation(String),

    #[error("max amount of overall threads reached")]
    MaxThreadsReached,

    #[error("thread {slot} failed to boot: {reason}")]
    BootFailed { slot: usize, reason: String },

    #[error("illegal state transition {from} -> {to}{}", slot.map(|s| format!(" on thread {s}")).unwrap_or_default())]
    InvalidTransition {
        slot: Option<usize>,
        from: &'static str,
        to: &'static str,
    },

    #[error("thread pool already started")]
    AlreadyStarted,

    #[error("thread pool is not ready (state: {0})")]
    NotReady(&'static str),

    #[error("no thread with index {0}")]
    UnknownSlot(usize),
}

pub type PoolResult<T> = Result<T, PoolError>;
