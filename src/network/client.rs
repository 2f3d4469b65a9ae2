//! NodeLink Client
//!
//! Opens channels to remote servers.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::RwLock;

use super::{ChannelInfo, NetworkChannel, NetworkConfig};
use crate::protocol::PacketListenerRegistry;

/// Client errors
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection timeout")]
    Timeout,
}

pub type ClientResult<T> = Result<T, ClientError>;

/// NodeLink Client
pub struct NetworkClient {
    /// Client configuration
    config: NetworkConfig,
    /// Listeners shared by every channel of this client
    registry: Arc<PacketListenerRegistry>,
    /// Open channels by id
    channels: Arc<RwLock<HashMap<u64, NetworkChannel>>>,
    next_channel_id: AtomicU64,
}

impl NetworkClient {
    /// Create a new client
    pub fn new(config: NetworkConfig) -> Self {
        Self::with_registry(config, Arc::new(PacketListenerRegistry::new()))
    }

    /// Create a client whose channels fall back to `registry`
    pub fn with_registry(config: NetworkConfig, registry: Arc<PacketListenerRegistry>) -> Self {
        Self {
            config,
            registry,
            channels: Arc::new(RwLock::new(HashMap::new())),
            next_channel_id: AtomicU64::new(1),
        }
    }

    /// Listeners shared by all channels of this client
    pub fn registry(&self) -> &Arc<PacketListenerRegistry> {
        &self.registry
    }

    /// Connect to a server by address
    pub async fn connect(&self, server_addr: SocketAddr) -> ClientResult<NetworkChannel> {
        tracing::info!("Connecting to {}", server_addr);

        // Connect with timeout
        let stream = tokio::time::timeout(self.config.connect_timeout(), TcpStream::connect(server_addr))
            .await
            .map_err(|_| ClientError::Timeout)??;
        stream.set_nodelay(true)?;

        let info = ChannelInfo {
            id: self.next_channel_id.fetch_add(1, Ordering::Relaxed),
            local_addr: stream.local_addr()?,
            remote_addr: server_addr,
            client_provided: true,
        };
        let registry = Arc::new(PacketListenerRegistry::with_parent(self.registry.clone()));
        let channel = NetworkChannel::open(stream, info, registry, &self.config);

        self.channels.write().await.insert(info.id, channel.clone());

        let channels = self.channels.clone();
        let watched = channel.clone();
        tokio::spawn(async move {
            watched.closed().await;
            channels.write().await.remove(&info.id);
        });

        Ok(channel)
    }

    /// Connect to a server by hostname
    pub async fn connect_hostname(&self, hostname: &str, port: u16) -> ClientResult<NetworkChannel> {
        let addr = super::resolve_host(hostname, port).await?;
        self.connect(addr).await
    }

    /// Get a list of open channels
    pub async fn channels(&self) -> Vec<NetworkChannel> {
        let channels = self.channels.read().await;
        let mut channels: Vec<NetworkChannel> = channels.values().cloned().collect();
        channels.sort_by_key(|channel| channel.id());
        channels
    }

    /// Close every open channel
    pub async fn close_all(&self) {
        let channels: Vec<NetworkChannel> = self.channels.read().await.values().cloned().collect();
        for channel in channels {
            channel.close();
        }
    }
}
