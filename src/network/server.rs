//! NodeLink Server
//!
//! The server accepts connections and opens a channel for each of them.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};

use super::{ChannelInfo, NetworkChannel, NetworkConfig};
use crate::protocol::{Packet, PacketListenerRegistry};

/// Server errors
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Server already running")]
    AlreadyRunning,

    #[error("Server not running")]
    NotRunning,

    #[error("Bind failed: {0}")]
    BindFailed(String),
}

pub type ServerResult<T> = Result<T, ServerError>;

/// Events emitted by the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    /// Server started
    Started { bind_addr: SocketAddr },
    /// A channel was opened for a new connection
    ChannelOpened { channel_id: u64, remote_addr: SocketAddr },
    /// A channel was closed
    ChannelClosed { channel_id: u64, remote_addr: SocketAddr },
    /// Server stopped
    Stopped,
    /// Error occurred
    Error { message: String },
}

type ChannelMap = Arc<RwLock<HashMap<u64, NetworkChannel>>>;

/// NodeLink Server
pub struct NetworkServer {
    /// Server configuration
    config: NetworkConfig,
    /// Listeners shared by every channel of this server
    registry: Arc<PacketListenerRegistry>,
    /// Open channels by id
    channels: ChannelMap,
    /// Event sender
    event_tx: mpsc::Sender<ServerEvent>,
    /// Event receiver (for consumers)
    event_rx: Option<mpsc::Receiver<ServerEvent>>,
    /// Shutdown signal
    shutdown_tx: Option<mpsc::Sender<()>>,
    /// Whether the server is running
    running: Arc<RwLock<bool>>,
    /// Bound address, once started
    local_addr: Option<SocketAddr>,
    next_channel_id: Arc<AtomicU64>,
}

impl NetworkServer {
    /// Create a new server
    pub fn new(config: NetworkConfig) -> Self {
        Self::with_registry(config, Arc::new(PacketListenerRegistry::new()))
    }

    /// Create a server whose channels fall back to `registry`
    pub fn with_registry(config: NetworkConfig, registry: Arc<PacketListenerRegistry>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);

        Self {
            config,
            registry,
            channels: Arc::new(RwLock::new(HashMap::new())),
            event_tx,
            event_rx: Some(event_rx),
            shutdown_tx: None,
            running: Arc::new(RwLock::new(false)),
            local_addr: None,
            next_channel_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Take the event receiver (can only be called once)
    pub fn take_event_receiver(&mut self) -> Option<mpsc::Receiver<ServerEvent>> {
        self.event_rx.take()
    }

    /// Listeners shared by all channels of this server
    pub fn registry(&self) -> &Arc<PacketListenerRegistry> {
        &self.registry
    }

    /// Address the server is bound to, once started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Start the server
    pub async fn start(&mut self) -> ServerResult<SocketAddr> {
        {
            let running = self.running.read().await;
            if *running {
                return Err(ServerError::AlreadyRunning);
            }
        }

        let bind_addr = format!("{}:{}", self.config.bind_address, self.config.port);
        let listener = TcpListener::bind(&bind_addr).await.map_err(|e| {
            ServerError::BindFailed(format!("Failed to bind to {}: {}", bind_addr, e))
        })?;

        let local_addr = listener.local_addr()?;
        self.local_addr = Some(local_addr);
        tracing::info!("Server listening on {}", local_addr);

        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        self.shutdown_tx = Some(shutdown_tx);

        {
            let mut running = self.running.write().await;
            *running = true;
        }

        emit(&self.event_tx, ServerEvent::Started { bind_addr: local_addr });

        let acceptor = Acceptor {
            config: self.config.clone(),
            registry: self.registry.clone(),
            channels: self.channels.clone(),
            event_tx: self.event_tx.clone(),
            next_channel_id: self.next_channel_id.clone(),
        };
        let running = self.running.clone();

        // Spawn the accept loop
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        match result {
                            Ok((stream, addr)) => {
                                tracing::info!("New connection from {}", addr);
                                if let Err(e) = acceptor.open(stream, addr).await {
                                    tracing::error!("Failed to open channel for {}: {}", addr, e);
                                    emit(&acceptor.event_tx, ServerEvent::Error { message: e.to_string() });
                                }
                            }
                            Err(e) => {
                                tracing::error!("Accept error: {}", e);
                                emit(&acceptor.event_tx, ServerEvent::Error { message: e.to_string() });
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        tracing::info!("Server shutdown requested");
                        break;
                    }
                }
            }

            let mut running = running.write().await;
            *running = false;

            emit(&acceptor.event_tx, ServerEvent::Stopped);
        });

        Ok(local_addr)
    }

    /// Stop accepting connections and close every open channel
    pub async fn stop(&mut self) -> ServerResult<()> {
        {
            let running = self.running.read().await;
            if !*running {
                return Err(ServerError::NotRunning);
            }
        }

        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(()).await;
        }

        let channels: Vec<NetworkChannel> = self.channels.read().await.values().cloned().collect();
        for channel in channels {
            channel.close();
        }

        Ok(())
    }

    /// Get a list of open channels
    pub async fn channels(&self) -> Vec<NetworkChannel> {
        let channels = self.channels.read().await;
        let mut channels: Vec<NetworkChannel> = channels.values().cloned().collect();
        channels.sort_by_key(|channel| channel.id());
        channels
    }

    /// Look up an open channel by id
    pub async fn channel(&self, id: u64) -> Option<NetworkChannel> {
        self.channels.read().await.get(&id).cloned()
    }

    /// Send a packet to all open channels. Returns how many accepted it.
    pub async fn broadcast(&self, packet: &Packet) -> usize {
        let channels = self.channels.read().await;
        channels
            .values()
            .filter(|channel| match channel.send(packet.clone()) {
                Ok(()) => true,
                Err(e) => {
                    tracing::debug!("Broadcast to channel {} failed: {}", channel.id(), e);
                    false
                }
            })
            .count()
    }

    /// Check if the server is running
    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }
}

/// State the accept loop needs to open channels
struct Acceptor {
    config: NetworkConfig,
    registry: Arc<PacketListenerRegistry>,
    channels: ChannelMap,
    event_tx: mpsc::Sender<ServerEvent>,
    next_channel_id: Arc<AtomicU64>,
}

impl Acceptor {
    async fn open(&self, stream: TcpStream, remote_addr: SocketAddr) -> std::io::Result<()> {
        stream.set_nodelay(true)?;
        let info = ChannelInfo {
            id: self.next_channel_id.fetch_add(1, Ordering::Relaxed),
            local_addr: stream.local_addr()?,
            remote_addr,
            client_provided: false,
        };

        let registry = Arc::new(PacketListenerRegistry::with_parent(self.registry.clone()));
        let channel = NetworkChannel::open(stream, info, registry, &self.config);

        self.channels.write().await.insert(info.id, channel.clone());
        emit(
            &self.event_tx,
            ServerEvent::ChannelOpened {
                channel_id: info.id,
                remote_addr,
            },
        );

        // Forget the channel once it closes
        let channels = self.channels.clone();
        let event_tx = self.event_tx.clone();
        tokio::spawn(async move {
            channel.closed().await;
            channels.write().await.remove(&info.id);
            emit(
                &event_tx,
                ServerEvent::ChannelClosed {
                    channel_id: info.id,
                    remote_addr,
                },
            );
        });

        Ok(())
    }
}

/// Events are best effort; a consumer that stopped reading never stalls the server.
fn emit(event_tx: &mpsc::Sender<ServerEvent>, event: ServerEvent) {
    if let Err(e) = event_tx.try_send(event) {
        tracing::trace!("Server event dropped: {}", e);
    }
}
