//! Connection registry and broadcast engine
//!
//! Maps each user id to the single live connection for that user. One lock
//! guards both membership changes and broadcast iteration, so a broadcast
//! never sees a half-applied add or delete.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::connection::Connection;
use super::frame::Frame;

/// Default bound on a single broadcast write
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Expected number of concurrent users
const INITIAL_CAPACITY: usize = 100;

/// Text delivered to the other users when `sender` sends `message`
pub fn format_broadcast(message: &str, sender: &str) -> String {
    format!("recv {}, from {}", message, sender)
}

/// Outcome of one broadcast fan-out
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Recipients the message was written to
    pub delivered: usize,
    /// Recipients whose write failed or timed out
    pub failed: usize,
}

/// Registry of live connections, one per user id
pub struct Registry {
    users: Mutex<HashMap<String, Arc<Connection>>>,
    shut_down: AtomicBool,
    write_timeout: Duration,
}

impl Registry {
    pub fn new(write_timeout: Duration) -> Self {
        Self {
            users: Mutex::new(HashMap::with_capacity(INITIAL_CAPACITY)),
            shut_down: AtomicBool::new(false),
            write_timeout,
        }
    }

    pub fn write_timeout(&self) -> Duration {
        self.write_timeout
    }

    /// Register `conn` for `user`, returning the connection it displaced
    ///
    /// The caller is responsible for closing the returned connection.
    pub async fn add_user(&self, user: &str, conn: Arc<Connection>) -> Option<Arc<Connection>> {
        let mut users = self.users.lock().await;
        let previous = users.insert(user.to_string(), conn);
        debug!("Registered user {} ({} online)", user, users.len());
        previous
    }

    /// Remove the entry for `user`. Removing an absent user is a no-op.
    pub async fn delete_user(&self, user: &str) -> bool {
        let mut users = self.users.lock().await;
        users.remove(user).is_some()
    }

    /// Remove the entry for `user` only if it still belongs to `conn_id`
    ///
    /// A displaced connection uses this on exit so it never deregisters the
    /// connection that replaced it.
    pub async fn remove_connection(&self, user: &str, conn_id: Uuid) -> bool {
        let mut users = self.users.lock().await;
        match users.get(user) {
            Some(current) if current.id() == conn_id => {
                users.remove(user);
                debug!("Deregistered user {} ({} online)", user, users.len());
                true
            }
            _ => false,
        }
    }

    pub async fn len(&self) -> usize {
        self.users.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.users.lock().await.is_empty()
    }

    pub async fn contains(&self, user: &str) -> bool {
        self.users.lock().await.contains_key(user)
    }

    /// Connection currently registered for `user`
    pub async fn get(&self, user: &str) -> Option<Arc<Connection>> {
        self.users.lock().await.get(user).cloned()
    }

    /// Write `message` from `sender` to every other registered user
    ///
    /// Holds the registry lock for the whole fan-out. A failed write is
    /// logged and counted; it neither stops the fan-out nor removes the
    /// recipient, whose own read loop is left to notice the broken peer.
    pub async fn broadcast(&self, sender: &str, message: &str) -> BroadcastReport {
        let text = format_broadcast(message, sender);
        let mut report = BroadcastReport::default();

        let users = self.users.lock().await;
        for (user, conn) in users.iter() {
            if user == sender {
                continue;
            }

            debug!("Sending to {}: {}", user, text);
            let write = conn.write_frame(Frame::text(text.as_str()));
            match tokio::time::timeout(self.write_timeout, write).await {
                Ok(Ok(())) => report.delivered += 1,
                Ok(Err(e)) => {
                    warn!("Write to user {} failed: {}", user, e);
                    report.failed += 1;
                }
                Err(_) => {
                    warn!(
                        "Write to user {} timed out after {:?}",
                        user, self.write_timeout
                    );
                    report.failed += 1;
                }
            }
        }

        report
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Close every registered connection
    ///
    /// Only the first call does anything; it returns `true`. Entries are left
    /// for each connection's handler to remove as its read loop unwinds.
    pub async fn shutdown(&self) -> bool {
        if self
            .shut_down
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        let users = self.users.lock().await;
        info!("Closing {} live connections", users.len());
        for conn in users.values() {
            conn.close().await;
        }
        true
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new(DEFAULT_WRITE_TIMEOUT)
    }
}
