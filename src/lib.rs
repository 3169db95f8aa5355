//! liveim chat relay
//!
//! Clients connect over WebSocket with a `user` query parameter and every text
//! message one of them sends is relayed to all the others. One user id maps to
//! at most one live connection; reconnecting kicks the older one.

pub mod client;
pub mod config;
pub mod server;
