//! In-memory sinks for driving connections in tests

use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use futures_util::Sink;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

/// Shared view of what a `RecordingSink` received
#[derive(Clone, Default)]
pub struct SinkLog {
    messages: Arc<Mutex<Vec<Message>>>,
    closed: Arc<Mutex<bool>>,
}

impl SinkLog {
    pub fn messages(&self) -> Vec<Message> {
        self.messages.lock().unwrap().clone()
    }

    pub fn texts(&self) -> Vec<String> {
        self.messages()
            .into_iter()
            .filter_map(|m| match m {
                Message::Text(text) => Some(text),
                _ => None,
            })
            .collect()
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.lock().unwrap()
    }
}

/// Sink that accepts every message and records it
pub struct RecordingSink {
    log: SinkLog,
}

impl RecordingSink {
    pub fn new() -> (Self, SinkLog) {
        let log = SinkLog::default();
        (Self { log: log.clone() }, log)
    }
}

impl Sink<Message> for RecordingSink {
    type Error = WsError;

    fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), WsError>> {
        Poll::Ready(Ok(()))
    }

    fn start_send(self: Pin<&mut Self>, item: Message) -> Result<(), WsError> {
        self.log.messages.lock().unwrap().push(item);
        Ok(())
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), WsError>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), WsError>> {
        *self.log.closed.lock().unwrap() = true;
        Poll::Ready(Ok(()))
    }
}

/// Sink whose peer has gone away: every write fails
pub struct FailingSink;

impl Sink<Message> for FailingSink {
    type Error = WsError;

    fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), WsError>> {
        Poll::Ready(Err(WsError::ConnectionClosed))
    }

    fn start_send(self: Pin<&mut Self>, _item: Message) -> Result<(), WsError> {
        Err(WsError::ConnectionClosed)
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), WsError>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), WsError>> {
        Poll::Ready(Ok(()))
    }
}

/// Sink whose peer stopped reading: writes never complete
pub struct StalledSink;

impl Sink<Message> for StalledSink {
    type Error = WsError;

    fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), WsError>> {
        Poll::Pending
    }

    fn start_send(self: Pin<&mut Self>, _item: Message) -> Result<(), WsError> {
        Ok(())
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), WsError>> {
        Poll::Pending
    }

    fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), WsError>> {
        Poll::Pending
    }
}

/// Poll `check` until it holds or `limit` elapses
pub async fn eventually<F>(limit: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
