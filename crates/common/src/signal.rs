//! Cooperative abort signal.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

use crate::error::{CutlineError, CutlineResult};

/// Shared flag checked at every suspension point of a cancellable operation.
///
/// Clones observe the same flag. Aborting is sticky: once set it stays set.
#[derive(Debug, Clone, Default)]
pub struct AbortSignal {
    flag: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl AbortSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation and wake every [`AbortSignal::aborted`] waiter.
    pub fn abort(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Whether cancellation was requested.
    pub fn is_aborted(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// `Err(Cancelled)` once aborted, for use with `?` at suspension points.
    pub fn check(&self) -> CutlineResult<()> {
        if self.is_aborted() {
            Err(CutlineError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Resolves once cancellation is requested. Race it against work that
    /// cannot check the flag itself.
    pub async fn aborted(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before reading the flag so an abort in between still wakes us.
            notified.as_mut().enable();
            if self.is_aborted() {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_clones_share_state() {
        let signal = AbortSignal::new();
        let observer = signal.clone();
        assert!(observer.check().is_ok());
        signal.abort();
        assert!(observer.is_aborted());
        assert!(observer.check().unwrap_err().is_cancelled());
    }

    #[tokio::test]
    async fn test_aborted_wakes_pending_waiter() {
        let signal = AbortSignal::new();
        let trigger = signal.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.abort();
        });
        tokio::time::timeout(Duration::from_secs(2), signal.aborted())
            .await
            .expect("waiter was not woken");
    }

    #[tokio::test]
    async fn test_aborted_resolves_immediately_once_set() {
        let signal = AbortSignal::new();
        signal.abort();
        tokio::time::timeout(Duration::from_millis(100), signal.aborted())
            .await
            .expect("already-aborted signal should resolve");
    }
}
