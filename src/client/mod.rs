//! Relay client module
//!
//! Connects to the relay as one user, keeps the connection alive with pings
//! and surfaces the text the relay delivers.

mod deadline;
mod session;

pub use deadline::ReadDeadline;
pub use session::*;
