// src/config.rs
//! Node configuration.
//!
//! The recognized options mirror the constructor surface of the node:
//! `host_domain`, `host_port`, and `host_ws_path`, plus the timeout and
//! cache-staleness knobs used by the transport, session, and resolution
//! layers. Configuration is a plain struct; loading it from files or the
//! environment is the caller's concern.

use std::time::Duration;

/// Configuration for a [`SimpleNode`](crate::SimpleNode).
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Host to bind the listener on and to advertise in the DID Document.
    pub host_domain: String,
    /// Port to bind and advertise.
    pub host_port: u16,
    /// WebSocket path prefix of the listener (e.g. `/ws`).
    pub host_ws_path: String,

    /// Deadline for establishing an outbound TCP/WebSocket connection.
    pub connect_timeout: Duration,
    /// Deadline for the mutual-authentication handshake (both roles).
    pub handshake_timeout: Duration,
    /// Deadline for an external resolution lookup.
    pub resolution_timeout: Duration,
    /// Staleness bound for cached DID Documents.
    pub resolve_ttl: Duration,
}

impl NodeConfig {
    /// Creates a configuration with default timeouts.
    ///
    /// The `host_ws_path` is normalized to carry a leading slash.
    pub fn new(host_domain: impl Into<String>, host_port: u16, host_ws_path: &str) -> Self {
        let path = if host_ws_path.starts_with('/') {
            host_ws_path.to_string()
        } else {
            format!("/{}", host_ws_path)
        };
        NodeConfig {
            host_domain: host_domain.into(),
            host_port,
            host_ws_path: path,
            ..Default::default()
        }
    }

    /// The `host:port` address the listener binds to.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host_domain, self.host_port)
    }

    /// The `ws://` endpoint advertised in this node's DID Document.
    pub fn advertised_endpoint(&self) -> String {
        format!(
            "ws://{}:{}{}",
            self.host_domain, self.host_port, self.host_ws_path
        )
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            host_domain: "localhost".to_string(),
            host_port: 8000,
            host_ws_path: "/ws".to_string(),
            connect_timeout: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(10),
            resolution_timeout: Duration::from_secs(5),
            resolve_ttl: Duration::from_secs(300),
        }
    }
}
