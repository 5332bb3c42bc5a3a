//! Server module
//!
//! HTTP health endpoint and the WebSocket gateway.

pub mod bind;
pub mod health;
pub mod ratelimit;
pub mod startup;
pub mod ws;

pub use startup::{run_server_with_config, ServerConfig, ServerHandle};
