//! Explicit cancellation scope for service lifetimes.
//!
//! Every long-lived service registers its background tasks against a
//! [`Scope`]. Cancelling the scope ends those tasks and releases their
//! subscriptions, which is how teardown propagates through the whole
//! subsystem without any ambient lifecycle machinery.

use tokio::sync::watch;

/// A cancellation scope. Cheap to clone; all clones observe the same
/// cancellation.
#[derive(Debug, Clone)]
pub struct Scope {
    tx: std::sync::Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl Scope {
    /// Create a new, uncancelled scope.
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: std::sync::Arc::new(tx),
            rx,
        }
    }

    /// Cancel the scope. Idempotent.
    pub fn cancel(&self) {
        // send only fails when every receiver is gone, which is fine.
        let _ = self.tx.send(true);
    }

    /// Whether the scope has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the scope is cancelled. Safe to await from many tasks.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        // wait_for only errors when the sender is dropped; treat that as
        // cancellation so orphaned tasks still wind down.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

impl Default for Scope {
    fn default() -> Self {
        Self::new()
    }
}
