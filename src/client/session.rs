//! Client session
//!
//! One connection to the relay, kept alive by two tasks: a read loop guarded
//! by a rolling read deadline, and a heartbeat loop that pings the server.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{Sink, Stream, StreamExt};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, info, warn};
use url::Url;

use super::deadline::ReadDeadline;
use crate::server::{Connection, Frame, FrameError, Opcode, USER_QUERY_PARAM};

/// Default relay address
pub const DEFAULT_SERVER_ADDR: &str = "ws://127.0.0.1:8000";

/// Default interval between pings
pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(5);

/// A peer silent for this many heartbeats is considered dead
pub const LIVENESS_MULTIPLIER: u32 = 3;

/// Longest the read loop waits for any frame after a ping went out
pub const PING_READ_WINDOW: Duration = Duration::from_secs(10);

/// Capacity of the inbound message channel
pub const INBOUND_CAPACITY: usize = 10;

/// Errors of a client session
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Invalid server address: {0}")]
    InvalidAddress(String),

    #[error("Failed to connect: {0}")]
    Connect(#[source] WsError),

    #[error("remote side closed the connection")]
    RemoteClosed,

    #[error("no frame received before the read deadline")]
    Timeout,

    #[error("stream ended without a close frame")]
    StreamEnded,

    #[error("transport error: {0}")]
    Transport(#[from] WsError),

    #[error("protocol violation: {0}")]
    Protocol(#[from] FrameError),

    #[error("read loop aborted")]
    Aborted,
}

/// Configuration for a client session
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Relay URL, `ws://` or `wss://`
    pub addr: String,
    /// User id sent with the upgrade request
    pub user: String,
    /// Interval between pings
    pub heartbeat: Duration,
}

impl ClientConfig {
    pub fn new(addr: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            user: user.into(),
            heartbeat: DEFAULT_HEARTBEAT,
        }
    }

    pub fn with_heartbeat(mut self, heartbeat: Duration) -> Self {
        self.heartbeat = heartbeat;
        self
    }
}

/// Read window the heartbeat imposes after each ping
pub fn ping_read_window(heartbeat: Duration) -> Duration {
    PING_READ_WINDOW.min(heartbeat * LIVENESS_MULTIPLIER)
}

/// Build the URL to dial: the relay address plus the encoded user id
pub fn dial_url(addr: &str, user: &str) -> Result<String, ClientError> {
    let mut url =
        Url::parse(addr).map_err(|e| ClientError::InvalidAddress(format!("{}: {}", addr, e)))?;

    if !matches!(url.scheme(), "ws" | "wss") {
        return Err(ClientError::InvalidAddress(format!(
            "{}: expected a ws:// or wss:// URL",
            addr
        )));
    }

    url.query_pairs_mut().append_pair(USER_QUERY_PARAM, user);
    Ok(url.into())
}

/// Dial the relay and start the session tasks
pub async fn connect(config: &ClientConfig) -> Result<ClientHandle, ClientError> {
    let url = dial_url(&config.addr, &config.user)?;
    info!("Connecting to {}", url);

    let (ws_stream, _) = connect_async(url.as_str())
        .await
        .map_err(ClientError::Connect)?;
    let (sink, stream) = ws_stream.split();

    Ok(ClientHandle::start(&config.user, sink, stream, config.heartbeat))
}

/// Handle to a running client session
///
/// Dropping the handle stops both session tasks.
pub struct ClientHandle {
    conn: Arc<Connection>,
    inbound: Option<mpsc::Receiver<String>>,
    closed: Option<oneshot::Receiver<ClientError>>,
    read_task: JoinHandle<()>,
    heartbeat_task: JoinHandle<()>,
}

impl ClientHandle {
    /// Start the read and heartbeat loops over an established connection
    pub fn start<Si, St>(user: &str, sink: Si, stream: St, heartbeat: Duration) -> Self
    where
        Si: Sink<Message, Error = WsError> + Send + 'static,
        St: Stream<Item = Result<Message, WsError>> + Send + Unpin + 'static,
    {
        let conn = Connection::new(user, sink);
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);
        let (closed_tx, closed_rx) = oneshot::channel();
        let deadline = ReadDeadline::new(heartbeat * LIVENESS_MULTIPLIER);

        let read_task = tokio::spawn({
            let conn = Arc::clone(&conn);
            let deadline = deadline.clone();
            async move {
                let exit = read_loop(stream, inbound_tx, &deadline, heartbeat).await;
                match exit {
                    ClientError::RemoteClosed => info!("Read loop returned: {}", exit),
                    _ => warn!("Read loop returned: {}", exit),
                }
                conn.close().await;
                let _ = closed_tx.send(exit);
            }
        });

        let heartbeat_task = tokio::spawn({
            let conn = Arc::clone(&conn);
            async move {
                if let Err(e) = heartbeat_loop(&conn, &deadline, heartbeat).await {
                    info!("Heartbeat loop returned: {}", e);
                }
            }
        });

        Self {
            conn,
            inbound: Some(inbound_rx),
            closed: Some(closed_rx),
            read_task,
            heartbeat_task,
        }
    }

    /// Take the channel of received text messages
    ///
    /// The channel closes when the read loop ends.
    pub fn take_inbound(&mut self) -> Option<mpsc::Receiver<String>> {
        self.inbound.take()
    }

    /// Write half of the session, for sending from another task
    pub fn connection(&self) -> Arc<Connection> {
        Arc::clone(&self.conn)
    }

    pub async fn send_text(&self, text: impl Into<String>) -> Result<(), ClientError> {
        Ok(self.conn.write_text(text).await?)
    }

    /// Wait for the session to end and return why
    ///
    /// Returns `None` once the exit has already been observed.
    pub async fn closed(&mut self) -> Option<ClientError> {
        let rx = self.closed.as_mut()?;
        let exit = rx.await.unwrap_or(ClientError::Aborted);
        self.closed = None;
        Some(exit)
    }
}

impl Drop for ClientHandle {
    fn drop(&mut self) {
        self.read_task.abort();
        self.heartbeat_task.abort();
    }
}

async fn read_loop<St>(
    mut stream: St,
    inbound: mpsc::Sender<String>,
    deadline: &ReadDeadline,
    heartbeat: Duration,
) -> ClientError
where
    St: Stream<Item = Result<Message, WsError>> + Unpin,
{
    info!("Read loop started");
    let window = heartbeat * LIVENESS_MULTIPLIER;
    deadline.reset(window);

    loop {
        let next = tokio::select! {
            _ = deadline.expired() => return ClientError::Timeout,
            next = stream.next() => next,
        };

        let message = match next {
            Some(Ok(message)) => message,
            Some(Err(e)) => return ClientError::Transport(e),
            None => return ClientError::StreamEnded,
        };

        // any frame from the server proves it is alive
        deadline.reset(window);

        let frame = match Frame::from_message(message) {
            Ok(frame) => frame,
            Err(FrameError::UnsupportedOpcode(opcode)) => {
                warn!("Server sent a {} frame, ignoring", opcode);
                continue;
            }
            Err(e) => return e.into(),
        };

        match frame.opcode {
            Opcode::Pong => debug!("Received pong"),
            // tungstenite queues the pong reply itself
            Opcode::Ping => debug!("Received ping"),
            Opcode::Close => return ClientError::RemoteClosed,
            Opcode::Text => {
                let text = match frame.into_text() {
                    Ok(text) => text,
                    Err(e) => return e.into(),
                };
                if inbound.send(text).await.is_err() {
                    debug!("Inbound channel closed, dropping message");
                }
            }
        }
    }
}

async fn heartbeat_loop(
    conn: &Connection,
    deadline: &ReadDeadline,
    heartbeat: Duration,
) -> Result<(), WsError> {
    info!("Heartbeat loop started");
    let mut ticker = tokio::time::interval_at(Instant::now() + heartbeat, heartbeat);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        debug!("Sending ping to server");
        deadline.shorten(ping_read_window(heartbeat));
        conn.write_frame(Frame::ping(Vec::new())).await?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;

    use crate::server::testing::{FailingSink, RecordingSink};

    const WAIT: Duration = Duration::from_secs(3);

    #[test]
    fn test_client_config() {
        let config = ClientConfig::new(DEFAULT_SERVER_ADDR, "alice");
        assert_eq!(config.heartbeat, DEFAULT_HEARTBEAT);

        let config = config.with_heartbeat(Duration::from_secs(1));
        assert_eq!(config.heartbeat, Duration::from_secs(1));
    }

    #[test]
    fn test_dial_url() {
        assert_eq!(
            dial_url("ws://127.0.0.1:8000", "alice").unwrap(),
            "ws://127.0.0.1:8000/?user=alice"
        );
        assert_eq!(
            dial_url("ws://chat.example.com/room", "bob").unwrap(),
            "ws://chat.example.com/room?user=bob"
        );
        assert_eq!(
            dial_url("wss://chat.example.com/?lang=en", "eve").unwrap(),
            "wss://chat.example.com/?lang=en&user=eve"
        );
    }

    #[test]
    fn test_dial_url_encodes_user() {
        assert_eq!(
            dial_url("ws://127.0.0.1:8000", "al ice").unwrap(),
            "ws://127.0.0.1:8000/?user=al+ice"
        );
        assert_eq!(
            dial_url("ws://127.0.0.1:8000", "tom&jerry").unwrap(),
            "ws://127.0.0.1:8000/?user=tom%26jerry"
        );
    }

    #[test]
    fn test_dial_url_rejects_bad_address() {
        assert!(matches!(
            dial_url("http://127.0.0.1:8000", "alice"),
            Err(ClientError::InvalidAddress(_))
        ));
        assert!(matches!(
            dial_url("not a url", "alice"),
            Err(ClientError::InvalidAddress(_))
        ));
    }

    #[test]
    fn test_ping_read_window() {
        assert_eq!(ping_read_window(Duration::from_secs(5)), Duration::from_secs(10));
        assert_eq!(ping_read_window(Duration::from_secs(1)), Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_text_is_forwarded_then_remote_close() {
        let (sink, log) = RecordingSink::new();
        let frames = stream::iter(vec![
            Ok(Message::Text("recv hi, from bob".to_string())),
            Ok(Message::Close(None)),
        ]);
        let mut handle = ClientHandle::start("alice", sink, frames, Duration::from_secs(5));
        let mut inbound = handle.take_inbound().unwrap();

        assert_eq!(inbound.recv().await.as_deref(), Some("recv hi, from bob"));
        let exit = tokio::time::timeout(WAIT, handle.closed()).await.unwrap();
        assert!(matches!(exit, Some(ClientError::RemoteClosed)));
        assert!(handle.closed().await.is_none());

        // the channel closes with the read loop
        assert_eq!(inbound.recv().await, None);
        assert!(log.is_closed());
    }

    #[tokio::test]
    async fn test_silent_server_times_out() {
        let heartbeat = Duration::from_millis(50);
        let (sink, log) = RecordingSink::new();
        let started = Instant::now();
        let mut handle = ClientHandle::start(
            "alice",
            sink,
            stream::pending::<Result<Message, WsError>>(),
            heartbeat,
        );

        let exit = tokio::time::timeout(WAIT, handle.closed()).await.unwrap();
        assert!(matches!(exit, Some(ClientError::Timeout)));
        assert!(started.elapsed() >= heartbeat * LIVENESS_MULTIPLIER);
        assert!(log.messages().contains(&Message::Ping(vec![])));
    }

    #[tokio::test]
    async fn test_pongs_keep_session_alive() {
        let heartbeat = Duration::from_millis(50);
        let (sink, _log) = RecordingSink::new();
        let pongs = stream::unfold(0u32, |sent| async move {
            if sent == 8 {
                return None;
            }
            tokio::time::sleep(Duration::from_millis(40)).await;
            Some((Ok(Message::Pong(vec![])), sent + 1))
        })
        .chain(stream::pending());
        let started = Instant::now();
        let mut handle = ClientHandle::start("alice", sink, Box::pin(pongs), heartbeat);

        let exit = tokio::time::timeout(WAIT, handle.closed()).await.unwrap();
        assert!(matches!(exit, Some(ClientError::Timeout)));
        // eight pongs 40ms apart, then a full liveness window
        assert!(started.elapsed() >= Duration::from_millis(320) + heartbeat * LIVENESS_MULTIPLIER);
    }

    #[tokio::test]
    async fn test_failed_ping_leaves_read_loop_running() {
        let heartbeat = Duration::from_millis(50);
        let mut handle = ClientHandle::start(
            "alice",
            FailingSink,
            stream::pending::<Result<Message, WsError>>(),
            heartbeat,
        );

        // only the read deadline ends the session
        let exit = tokio::time::timeout(WAIT, handle.closed()).await.unwrap();
        assert!(matches!(exit, Some(ClientError::Timeout)));
    }

    #[tokio::test]
    async fn test_send_text() {
        let (sink, log) = RecordingSink::new();
        let handle = ClientHandle::start(
            "alice",
            sink,
            stream::pending::<Result<Message, WsError>>(),
            Duration::from_secs(5),
        );

        handle.send_text("hello room").await.unwrap();
        assert_eq!(log.texts(), vec!["hello room"]);
    }
}
