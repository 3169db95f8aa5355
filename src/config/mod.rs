//! Configuration module
//!
//! Loads the relay config file and merges it with command-line settings.

mod settings;

pub use settings::*;
