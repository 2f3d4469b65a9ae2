//! Network module - Handles TCP communication between nodes
//!
//! Provides:
//! - Network channels wrapping one connection each
//! - Server for accepting incoming connections
//! - Client for connecting to servers

mod channel;
mod client;
mod server;

pub use channel::*;
pub use client::*;
pub use server::*;

use std::net::SocketAddr;
use std::time::Duration;

/// Configuration for network operations
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Address to bind servers to
    pub bind_address: String,
    /// Port to listen on or connect to
    pub port: u16,
    /// Connection timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// Timeout for queries sent without an explicit one, in milliseconds
    pub query_timeout_ms: u64,
    /// Maximum frame size
    pub max_frame_size: usize,
    /// Queued outbound packets above which a channel reports itself as not writable
    pub write_high_water: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: crate::protocol::DEFAULT_PORT,
            connect_timeout_ms: 5000,
            query_timeout_ms: 30_000,
            max_frame_size: crate::protocol::MAX_FRAME_SIZE,
            write_high_water: 1024,
        }
    }
}

impl NetworkConfig {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            ..Default::default()
        }
    }

    pub fn with_bind_address(mut self, bind_address: impl Into<String>) -> Self {
        self.bind_address = bind_address.into();
        self
    }

    pub fn with_query_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }
}

/// Resolve a hostname to a socket address
pub async fn resolve_host(host: &str, port: u16) -> std::io::Result<SocketAddr> {
    use tokio::net::lookup_host;

    let addr_string = format!("{}:{}", host, port);
    let mut addrs = lookup_host(&addr_string).await?;

    addrs.next().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("Could not resolve host: {}", host),
        )
    })
}

/// In-memory channels for tests
#[cfg(test)]
pub(crate) mod testing {
    use std::net::SocketAddr;
    use std::sync::Arc;

    use super::{ChannelInfo, NetworkChannel, NetworkConfig};
    use crate::protocol::PacketListenerRegistry;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    /// Two channels connected to each other through an in-memory pipe
    pub(crate) fn channel_pair(
        left: Arc<PacketListenerRegistry>,
        right: Arc<PacketListenerRegistry>,
    ) -> (NetworkChannel, NetworkChannel) {
        let config = NetworkConfig::default();
        let (a, b) = tokio::io::duplex(64 * 1024);

        let left = NetworkChannel::open(
            a,
            ChannelInfo {
                id: 1,
                local_addr: addr(1000),
                remote_addr: addr(2000),
                client_provided: true,
            },
            left,
            &config,
        );
        let right = NetworkChannel::open(
            b,
            ChannelInfo {
                id: 1,
                local_addr: addr(2000),
                remote_addr: addr(1000),
                client_provided: false,
            },
            right,
            &config,
        );
        (left, right)
    }

    /// A channel whose peer is already gone
    pub(crate) fn detached_channel() -> NetworkChannel {
        let (a, _) = tokio::io::duplex(1024);
        NetworkChannel::open(
            a,
            ChannelInfo {
                id: 1,
                local_addr: addr(1000),
                remote_addr: addr(2000),
                client_provided: true,
            },
            Arc::new(PacketListenerRegistry::new()),
            &NetworkConfig::default(),
        )
    }
}
