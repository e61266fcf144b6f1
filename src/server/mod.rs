//! Server module
//!
//! WebSocket gateway (upgrade broker + message router) and testable startup.

pub mod startup;
pub mod ws;

pub use startup::{run_server_with_config, ServerConfig, ServerHandle};
pub use ws::{GatewayState, ServerFrame};
