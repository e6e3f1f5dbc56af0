//! The single cancellation signal shared by every per-shard task spawned
//! for one command (§5 "Cancellation"): raised by `Cancel()`, expiry of the
//! overall `command_timeout`, or a fatal failure under `CompleteResults`.

use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;

/// A one-shot, broadcast cancellation flag. Cheap to clone via `Arc`;
/// `canceled()` is the suspension point every per-shard task and the
/// merged reader select against.
#[derive(Default)]
pub struct CancellationSignal {
    flag: AtomicBool,
    notify: Notify,
}

impl CancellationSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_canceled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Raises the signal and wakes every task currently awaiting
    /// [`CancellationSignal::canceled`]. Idempotent.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Resolves once the signal has been raised, including if it was
    /// already raised before this call. Built on `Notify`'s "enable then
    /// check" pattern so a `cancel()` landing between the flag check and
    /// the await can never be missed.
    pub async fn canceled(&self) {
        loop {
            if self.is_canceled() {
                return;
            }
            let notified = self.notify.notified();
            if self.is_canceled() {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn canceled_resolves_immediately_if_already_raised() {
        let signal = CancellationSignal::new();
        signal.cancel();
        tokio::time::timeout(Duration::from_millis(50), signal.canceled()).await.unwrap();
    }

    #[tokio::test]
    async fn canceled_wakes_pending_waiters() {
        let signal = Arc::new(CancellationSignal::new());
        let waiter = {
            let signal = signal.clone();
            tokio::spawn(async move {
                signal.canceled().await;
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        signal.cancel();
        tokio::time::timeout(Duration::from_millis(50), waiter).await.unwrap().unwrap();
    }
}
