//! Server-side connection handler
//!
//! Drives the read loop of one registered connection: answers pings, hands
//! text to the broadcast engine and, whatever ends the loop, closes the
//! connection and removes its registry entry exactly once.

use std::sync::Arc;

use futures_util::{Stream, StreamExt};
use thiserror::Error;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, error, info, warn};

use super::connection::Connection;
use super::frame::{Frame, FrameError, Opcode};
use super::registry::Registry;

/// Why a connection's read loop ended
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("remote side closed the connection")]
    RemoteClosed,

    #[error("connection closed locally")]
    LocalClosed,

    #[error("stream ended without a close frame")]
    StreamEnded,

    #[error("transport error: {0}")]
    Transport(#[from] WsError),

    #[error("protocol violation: {0}")]
    Protocol(#[from] FrameError),
}

/// Run a registered connection until it ends, then clean it up
///
/// Returns the condition that ended the read loop.
pub async fn run<S>(
    user: String,
    conn: Arc<Connection>,
    frames: S,
    registry: Arc<Registry>,
) -> HandlerError
where
    S: Stream<Item = Result<Message, WsError>> + Unpin,
{
    let exit = read_loop(&user, &conn, frames, &registry).await;

    match &exit {
        HandlerError::RemoteClosed | HandlerError::LocalClosed => {
            info!("User {} read loop ended: {}", user, exit)
        }
        _ => error!("User {} read loop failed: {}", user, exit),
    }

    conn.close().await;
    registry.remove_connection(&user, conn.id()).await;
    info!("User {} connection closed", user);

    exit
}

async fn read_loop<S>(
    user: &str,
    conn: &Connection,
    mut frames: S,
    registry: &Arc<Registry>,
) -> HandlerError
where
    S: Stream<Item = Result<Message, WsError>> + Unpin,
{
    loop {
        let next = tokio::select! {
            _ = conn.wait_closed() => return HandlerError::LocalClosed,
            next = frames.next() => next,
        };

        let message = match next {
            Some(Ok(message)) => message,
            Some(Err(e)) => return HandlerError::Transport(e),
            None => return HandlerError::StreamEnded,
        };

        let mut frame = match Frame::from_message(message) {
            Ok(frame) => frame,
            Err(FrameError::UnsupportedOpcode(opcode)) => {
                warn!("User {} sent a {} frame, ignoring", user, opcode);
                continue;
            }
            Err(e) => return e.into(),
        };
        frame.unmask();

        match frame.opcode {
            Opcode::Close => return HandlerError::RemoteClosed,
            Opcode::Ping => {
                debug!("Ping from user {}, replying with pong", user);
                let reply = conn.write_frame(Frame::pong(frame.payload));
                match tokio::time::timeout(registry.write_timeout(), reply).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => error!("Failed to send pong to user {}: {}", user, e),
                    Err(_) => error!("Pong to user {} timed out", user),
                }
            }
            Opcode::Pong => debug!("Pong from user {}", user),
            Opcode::Text => {
                let text = match frame.into_text() {
                    Ok(text) => text,
                    Err(e) => return e.into(),
                };
                info!("Received message from {}: {}", user, text);

                let registry = Arc::clone(registry);
                let sender = user.to_string();
                tokio::spawn(async move {
                    let report = registry.broadcast(&sender, &text).await;
                    debug!(
                        "Broadcast from {}: {} delivered, {} failed",
                        sender, report.delivered, report.failed
                    );
                });
            }
        }
    }
}
