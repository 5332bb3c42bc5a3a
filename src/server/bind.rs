//! Bind mode resolution
//!
//! Parses `gateway.bind` config values:
//! - `loopback` -> 127.0.0.1 (default)
//! - `any` / `all` / `0.0.0.0` -> all interfaces
//! - an explicit IP, `ip:port`, or hostname -> used as-is

use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum BindMode {
    #[default]
    Loopback,
    Any,
    Custom(String),
}

#[derive(Error, Debug)]
pub enum BindError {
    #[error("Failed to resolve bind address {host}: {message}")]
    ResolutionFailed { host: String, message: String },
}

pub fn parse_bind_mode(value: &str) -> BindMode {
    match value.trim().to_lowercase().as_str() {
        "loopback" | "localhost" | "local" => BindMode::Loopback,
        "any" | "all" | "0.0.0.0" => BindMode::Any,
        other => BindMode::Custom(other.to_string()),
    }
}

/// Resolve a bind mode to a socket address. A `Custom` value carrying its own
/// port overrides `port`.
pub fn resolve_bind_address(mode: &BindMode, port: u16) -> Result<SocketAddr, BindError> {
    match mode {
        BindMode::Loopback => Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)),
        BindMode::Any => Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port)),
        BindMode::Custom(addr) => resolve_custom_address(addr, port),
    }
}

fn resolve_custom_address(addr: &str, default_port: u16) -> Result<SocketAddr, BindError> {
    if let Ok(sock) = addr.parse::<SocketAddr>() {
        return Ok(sock);
    }
    if let Ok(ip) = addr.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, default_port));
    }

    let candidate = if addr.contains(':') {
        addr.to_string()
    } else {
        format!("{addr}:{default_port}")
    };
    let mut resolved = candidate
        .to_socket_addrs()
        .map_err(|e| BindError::ResolutionFailed {
            host: addr.to_string(),
            message: e.to_string(),
        })?;
    resolved.next().ok_or_else(|| BindError::ResolutionFailed {
        host: addr.to_string(),
        message: "no addresses found".to_string(),
    })
}
