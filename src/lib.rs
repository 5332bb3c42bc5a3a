//! termgate library
//!
//! Command parsing, permission-gated dispatch, and WebSocket sessions with
//! topic fan-out for a browser terminal.

pub mod cli;
pub mod commands;
pub mod config;
pub mod logging;
pub mod server;
pub mod services;
