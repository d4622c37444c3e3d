//! Cooperative cancellation for long-running download loops.
//!
//! The retry loop in [`super::session`] can otherwise run forever; every
//! sleep in the fetch path selects against the token.

use tokio::sync::watch;

/// Owning side of a cancellation signal. Dropping it does NOT cancel.
pub struct CancelSource {
    tx: watch::Sender<bool>,
}

impl CancelSource {
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

/// Cloneable token handed to anything that sleeps or retries.
#[derive(Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancellation is requested.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                // Source dropped without cancelling; park forever so that
                // select! arms against us never fire spuriously.
                std::future::pending::<()>().await;
            }
        }
    }

    /// A token that never fires. Handy for tests and one-shot fetches.
    pub fn never() -> Self {
        let (tx, rx) = watch::channel(false);
        // Leak the sender so the channel stays open.
        std::mem::forget(tx);
        CancelToken { rx }
    }
}

/// Creates a linked source/token pair.
pub fn cancel_pair() -> (CancelSource, CancelToken) {
    let (tx, rx) = watch::channel(false);
    (CancelSource { tx }, CancelToken { rx })
}
