//! Relay server module
//!
//! Tracks live connections per user, rebroadcasts text between them and
//! keeps the per-connection read loops running.

mod connection;
mod frame;
pub mod handler;
mod registry;
mod websocket;

#[cfg(test)]
pub(crate) mod testing;

pub use connection::{Connection, FrameSink};
pub use frame::{apply_mask, Frame, FrameError, Opcode};
pub use handler::HandlerError;
pub use registry::{format_broadcast, BroadcastReport, Registry, DEFAULT_WRITE_TIMEOUT};
pub use websocket::{user_from_query, RelayServer, ServerConfig, USER_QUERY_PARAM};
