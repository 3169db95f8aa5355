//! Shared connection handle
//!
//! The read half of a connection is owned by its handler task. The write half
//! lives here so the registry can reach it for broadcast writes, and carries a
//! one-shot close signal that the owning read loop watches.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{Sink, SinkExt};
use tokio::sync::{watch, Mutex};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::debug;
use uuid::Uuid;

use super::frame::Frame;

/// Upper bound for sending the close frame to a peer that stopped reading
const CLOSE_FRAME_TIMEOUT: Duration = Duration::from_secs(1);

/// Boxed write half of a WebSocket connection
pub type FrameSink = Pin<Box<dyn Sink<Message, Error = WsError> + Send>>;

/// Write half of a live connection plus its close signal
pub struct Connection {
    id: Uuid,
    user: String,
    sink: Mutex<FrameSink>,
    closed: watch::Sender<bool>,
}

impl Connection {
    pub fn new<S>(user: impl Into<String>, sink: S) -> Arc<Self>
    where
        S: Sink<Message, Error = WsError> + Send + 'static,
    {
        let (closed, _) = watch::channel(false);
        Arc::new(Self {
            id: Uuid::new_v4(),
            user: user.into(),
            sink: Mutex::new(Box::pin(sink)),
            closed,
        })
    }

    /// Unique id of this connection, distinct across reconnects of one user
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Resolve once the connection has been closed
    pub async fn wait_closed(&self) {
        let mut closed = self.closed.subscribe();
        let _ = closed.wait_for(|closed| *closed).await;
    }

    /// Write one frame. Fails with `AlreadyClosed` after `close`.
    pub async fn write_frame(&self, frame: Frame) -> Result<(), WsError> {
        if self.is_closed() {
            return Err(WsError::AlreadyClosed);
        }
        let mut sink = self.sink.lock().await;
        sink.send(frame.into_message()).await
    }

    pub async fn write_text(&self, text: impl Into<String>) -> Result<(), WsError> {
        self.write_frame(Frame::text(text)).await
    }

    /// Close the connection. Only the first call does anything.
    ///
    /// Returns `true` if this call closed it.
    pub async fn close(&self) -> bool {
        let first = self.closed.send_if_modified(|closed| {
            if *closed {
                false
            } else {
                *closed = true;
                true
            }
        });
        if !first {
            return false;
        }

        let result = tokio::time::timeout(CLOSE_FRAME_TIMEOUT, async {
            let mut sink = self.sink.lock().await;
            sink.send(Frame::close().into_message()).await?;
            sink.close().await
        })
        .await;
        match result {
            Ok(Ok(())) => debug!("Connection {} of user {} closed", self.id, self.user),
            Ok(Err(e)) => debug!("Close frame to user {} not delivered: {}", self.user, e),
            Err(_) => debug!("Close frame to user {} timed out", self.user),
        }
        true
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("user", &self.user)
            .field("closed", &self.is_closed())
            .finish()
    }
}
