//! Rolling read deadline
//!
//! A deadline shared between the read loop, which waits on it, and anything
//! that observes liveness, which re-arms it. Re-arming never needs the
//! transport's own deadline API.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{sleep_until, Instant};

#[derive(Debug, Clone)]
pub struct ReadDeadline {
    tx: Arc<watch::Sender<Instant>>,
}

impl ReadDeadline {
    /// Deadline `after` from now
    pub fn new(after: Duration) -> Self {
        let (tx, _) = watch::channel(Instant::now() + after);
        Self { tx: Arc::new(tx) }
    }

    pub fn deadline(&self) -> Instant {
        *self.tx.borrow()
    }

    /// Move the deadline to `after` from now
    pub fn reset(&self, after: Duration) {
        self.tx.send_replace(Instant::now() + after);
    }

    /// Pull the deadline in to `after` from now if that is sooner
    pub fn shorten(&self, after: Duration) {
        let candidate = Instant::now() + after;
        self.tx.send_if_modified(|deadline| {
            if candidate < *deadline {
                *deadline = candidate;
                true
            } else {
                false
            }
        });
    }

    /// Resolve once the deadline passes, following any re-arms meanwhile
    pub async fn expired(&self) {
        let mut rx = self.tx.subscribe();
        loop {
            let deadline = *rx.borrow_and_update();
            tokio::select! {
                _ = sleep_until(deadline) => return,
                changed = rx.changed() => {
                    if changed.is_err() {
                        sleep_until(deadline).await;
                        return;
                    }
                }
            }
        }
    }
}
