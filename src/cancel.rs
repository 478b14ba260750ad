//! Run cancellation over a `tokio::sync::watch` channel.

use std::future::Future;

use tokio::sync::watch;

/// Receiving side of a cancellation request. Clone one per task.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

impl CancelSignal {
    pub fn new(rx: watch::Receiver<bool>) -> Self {
        Self { rx }
    }

    /// A signal that never fires.
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }

    /// Create a sender and its signal.
    pub fn channel() -> (watch::Sender<bool>, Self) {
        let (tx, rx) = watch::channel(false);
        (tx, Self { rx })
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancellation is requested. A dropped sender never cancels.
    pub async fn cancelled(&mut self) {
        if self.rx.wait_for(|c| *c).await.is_err() {
            std::future::pending::<()>().await;
        }
    }

    /// Drive `fut` unless cancellation is requested first.
    pub async fn run<F: Future>(&mut self, fut: F) -> Option<F::Output> {
        if self.is_cancelled() {
            return None;
        }
        tokio::select! {
            out = fut => Some(out),
            _ = self.cancelled() => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_run_completes_without_cancel() {
        let mut signal = CancelSignal::never();
        assert_eq!(signal.run(async { 7 }).await, Some(7));
    }

    #[tokio::test]
    async fn test_cancel_interrupts_pending_future() {
        let (tx, mut signal) = CancelSignal::channel();
        let handle = tokio::spawn(async move {
            signal
                .run(tokio::time::sleep(Duration::from_secs(60)))
                .await
        });
        tx.send(true).unwrap();
        assert_eq!(handle.await.unwrap(), None);
    }
}
