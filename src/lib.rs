//! chatcell gateway library
//!
//! Core functionality for the chatcell gateway: per-device isolated
//! WebSocket channels, session and device registries, isolation strategies
//! (in-process and out-of-process), and idle reaping.

pub mod config;
pub mod devices;
pub mod history;
pub mod identity;
pub mod isolation;
pub mod logging;
pub mod reaper;
pub mod registry;
pub mod server;
pub mod worker;
