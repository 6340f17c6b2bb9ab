//! DoneSignal — the process-wide shutdown broadcast.
//!
//! Closed exactly once, at the start of a drain. Observers are never
//! consumed: every receiver sees the closed value, including receivers
//! subscribed after the close.

use std::sync::Arc;

use tokio::sync::watch;

#[derive(Debug, Clone)]
pub struct DoneSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl DoneSignal {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Close the signal. Returns `true` only for the call that closed it.
    pub fn close(&self) -> bool {
        self.tx.send_if_modified(|closed| {
            if *closed {
                false
            } else {
                *closed = true;
                true
            }
        })
    }

    pub fn is_closed(&self) -> bool {
        *self.tx.borrow()
    }

    /// A receiver that reads `true` once the signal is closed.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    /// Resolve once the signal is closed.
    pub async fn closed(&self) {
        let mut rx = self.subscribe();
        // The sender lives as long as `self`, so this only returns once closed.
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

impl Default for DoneSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn closes_exactly_once() {
        let done = DoneSignal::new();
        assert!(!done.is_closed());
        assert!(done.close());
        assert!(!done.close());
        assert!(done.is_closed());
    }

    #[test]
    fn late_subscribers_see_closed_value() {
        let done = DoneSignal::new();
        done.close();
        assert!(*done.subscribe().borrow());
    }

    #[tokio::test]
    async fn all_observers_are_woken() {
        let done = DoneSignal::new();
        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let done = done.clone();
                tokio::spawn(async move { done.closed().await })
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(10)).await;
        done.close();

        for waiter in waiters {
            tokio::time::timeout(Duration::from_secs(1), waiter)
                .await
                .expect("observer was not woken")
                .unwrap();
        }
    }

    #[tokio::test]
    async fn closed_returns_immediately_after_close() {
        let done = DoneSignal::new();
        done.close();
        tokio::time::timeout(Duration::from_millis(100), done.closed())
            .await
            .unwrap();
    }
}
