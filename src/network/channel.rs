//! Network channel handling for NodeLink
//!
//! A channel wraps one connection and owns:
//! - The framing of packets on the byte stream
//! - A listener registry for inbound packets
//! - A query manager for responses to outbound queries

use bytes::{Bytes, BytesMut};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use super::NetworkConfig;
use crate::protocol::{
    CodecError, Decoder, Encoder, Packet, PacketListenerRegistry, QueryError, QueryHandle, QueryManager,
};

/// Channel errors
#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Codec(#[from] CodecError),

    #[error("Channel closed")]
    Closed,

    #[error("Query failed: {0}")]
    Query(#[from] QueryError),
}

pub type ChannelResult<T> = Result<T, ChannelError>;

/// Identity of a channel, fixed once the connection is established
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelInfo {
    /// Channel id, unique per server or client
    pub id: u64,
    pub local_addr: SocketAddr,
    pub remote_addr: SocketAddr,
    /// Whether this side opened the connection
    pub client_provided: bool,
}

/// Channel statistics
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ChannelStats {
    /// Packets sent
    pub packets_sent: u64,
    /// Packets received
    pub packets_received: u64,
    /// Bytes sent
    pub bytes_sent: u64,
    /// Bytes received
    pub bytes_received: u64,
}

#[derive(Default)]
struct StatCounters {
    packets_sent: AtomicU64,
    packets_received: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
}

struct ChannelInner {
    info: ChannelInfo,
    registry: Arc<PacketListenerRegistry>,
    queries: QueryManager,
    encoder: Encoder,
    outbound: mpsc::UnboundedSender<Bytes>,
    active: AtomicBool,
    queued_writes: AtomicUsize,
    write_high_water: usize,
    default_query_timeout: Duration,
    shutdown: watch::Sender<bool>,
    stats: StatCounters,
}

/// A handle to one open connection. Cheap to clone.
#[derive(Clone)]
pub struct NetworkChannel {
    inner: Arc<ChannelInner>,
}

impl std::fmt::Debug for NetworkChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkChannel")
            .field("info", &self.inner.info)
            .field("active", &self.is_active())
            .finish()
    }
}

impl NetworkChannel {
    /// Start serving a connection.
    ///
    /// Spawns the read, write and dispatch tasks on the current runtime.
    /// Inbound packets go to `registry` unless they answer a pending query.
    pub fn open<S>(
        stream: S,
        info: ChannelInfo,
        registry: Arc<PacketListenerRegistry>,
        config: &NetworkConfig,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (shutdown, _) = watch::channel(false);

        let channel = Self {
            inner: Arc::new(ChannelInner {
                info,
                registry,
                queries: QueryManager::new(Handle::current()),
                encoder: Encoder::with_max_frame_size(config.max_frame_size),
                outbound: outbound_tx,
                active: AtomicBool::new(true),
                queued_writes: AtomicUsize::new(0),
                write_high_water: config.write_high_water,
                default_query_timeout: config.query_timeout(),
                shutdown,
                stats: StatCounters::default(),
            }),
        };

        tokio::spawn(write_loop(channel.clone(), writer, outbound_rx));
        tokio::spawn(read_loop(
            channel.clone(),
            reader,
            Decoder::with_max_frame_size(config.max_frame_size),
            inbound_tx,
        ));
        tokio::spawn(dispatch_loop(channel.clone(), inbound_rx));

        tracing::info!(
            "Channel {} opened ({} <-> {})",
            info.id,
            info.local_addr,
            info.remote_addr
        );
        channel
    }

    pub fn info(&self) -> ChannelInfo {
        self.inner.info
    }

    pub fn id(&self) -> u64 {
        self.inner.info.id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.info.local_addr
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.inner.info.remote_addr
    }

    pub fn client_provided(&self) -> bool {
        self.inner.info.client_provided
    }

    /// The listener registry of this channel
    pub fn registry(&self) -> &Arc<PacketListenerRegistry> {
        &self.inner.registry
    }

    pub fn queries(&self) -> &QueryManager {
        &self.inner.queries
    }

    pub fn default_query_timeout(&self) -> Duration {
        self.inner.default_query_timeout
    }

    /// Check if the channel is still open
    pub fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::SeqCst)
    }

    /// Whether the outbound queue is below its high-water mark
    pub fn is_writable(&self) -> bool {
        self.is_active() && self.inner.queued_writes.load(Ordering::SeqCst) < self.inner.write_high_water
    }

    /// Get channel statistics
    pub fn stats(&self) -> ChannelStats {
        let stats = &self.inner.stats;
        ChannelStats {
            packets_sent: stats.packets_sent.load(Ordering::Relaxed),
            packets_received: stats.packets_received.load(Ordering::Relaxed),
            bytes_sent: stats.bytes_sent.load(Ordering::Relaxed),
            bytes_received: stats.bytes_received.load(Ordering::Relaxed),
        }
    }

    /// Queue a packet for transmission.
    ///
    /// Fails fast once the channel is closed. Success only means the packet
    /// was queued; delivery is up to the transport.
    pub fn send(&self, packet: Packet) -> ChannelResult<()> {
        if !self.is_active() {
            return Err(ChannelError::Closed);
        }

        let mut buf = BytesMut::new();
        self.inner.encoder.encode(&packet, &mut buf)?;
        self.enqueue(buf.freeze())
    }

    fn enqueue(&self, frame: Bytes) -> ChannelResult<()> {
        self.inner.queued_writes.fetch_add(1, Ordering::SeqCst);
        if self.inner.outbound.send(frame).is_err() {
            self.inner.queued_writes.fetch_sub(1, Ordering::SeqCst);
            return Err(ChannelError::Closed);
        }
        Ok(())
    }

    /// Send `packet` as a query and return a handle to its response.
    ///
    /// A packet without correlation id gets a fresh one; the handle reports
    /// which id was used.
    pub fn send_query_async(&self, packet: Packet, timeout: Duration) -> ChannelResult<QueryHandle> {
        if !self.is_active() {
            return Err(ChannelError::Closed);
        }

        let unique_id = packet.unique_id().unwrap_or_else(Uuid::new_v4);
        let packet = packet.into_query(unique_id);

        let mut buf = BytesMut::new();
        self.inner.encoder.encode(&packet, &mut buf)?;

        let handle = self.inner.queries.register(unique_id, timeout)?;
        if let Err(e) = self.enqueue(buf.freeze()) {
            self.inner.queries.cancel(&unique_id);
            return Err(e);
        }
        Ok(handle)
    }

    /// Send a query and await its response
    pub async fn query(&self, packet: Packet, timeout: Duration) -> ChannelResult<Packet> {
        Ok(self.send_query_async(packet, timeout)?.await?)
    }

    /// Send a query and block the current thread until the response arrives.
    ///
    /// Must not be called from within an async context.
    pub fn send_query(&self, packet: Packet, timeout: Duration) -> ChannelResult<Packet> {
        Ok(self.send_query_async(packet, timeout)?.wait()?)
    }

    /// Close the channel.
    ///
    /// Idempotent. Cancels every pending query, stops accepting packets and
    /// shuts the connection down once queued packets are written.
    pub fn close(&self) {
        if !self.inner.active.swap(false, Ordering::SeqCst) {
            return;
        }

        let cancelled = self.inner.queries.cancel_all();
        self.inner.shutdown.send_replace(true);

        tracing::info!(
            "Channel {} closed ({}), {} pending queries cancelled",
            self.id(),
            self.remote_addr(),
            cancelled
        );
    }

    /// Wait until the channel is closed
    pub async fn closed(&self) {
        let mut shutdown = self.inner.shutdown.subscribe();
        // The sender lives as long as `self`, so this cannot fail
        let _ = shutdown.wait_for(|closed| *closed).await;
    }

    fn handle_inbound(&self, packet: Packet, inbound: &mpsc::UnboundedSender<Packet>) {
        self.inner.stats.packets_received.fetch_add(1, Ordering::Relaxed);

        // Responses are consumed by the query path, never by listeners
        if packet.is_query() && self.inner.queries.complete_query(&packet) {
            return;
        }

        if inbound.send(packet).is_err() {
            tracing::debug!("Channel {} dispatcher gone, dropping packet", self.id());
        }
    }
}

async fn write_loop<W>(channel: NetworkChannel, mut writer: W, mut outbound: mpsc::UnboundedReceiver<Bytes>)
where
    W: AsyncWrite + Unpin,
{
    let mut shutdown = channel.inner.shutdown.subscribe();

    let result: std::io::Result<()> = async {
        loop {
            tokio::select! {
                biased;
                Some(frame) = outbound.recv() => {
                    write_frame(&channel, &mut writer, &frame).await?;
                }
                _ = closed_signal(&mut shutdown) => break,
            }
        }

        // Flush packets queued before the close
        while let Ok(frame) = outbound.try_recv() {
            write_frame(&channel, &mut writer, &frame).await?;
        }
        writer.shutdown().await
    }
    .await;

    if let Err(e) = result {
        tracing::warn!("Channel {} write error: {}", channel.id(), e);
    }
    channel.close();
}

/// Resolves once the channel is closed. Releases the watch guard before
/// returning so the result can be held across other awaits.
async fn closed_signal(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|closed| *closed).await.map(|_| ());
}

async fn write_frame<W>(channel: &NetworkChannel, writer: &mut W, frame: &Bytes) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    channel.inner.queued_writes.fetch_sub(1, Ordering::SeqCst);
    writer.write_all(frame).await?;
    writer.flush().await?;

    let stats = &channel.inner.stats;
    stats.packets_sent.fetch_add(1, Ordering::Relaxed);
    stats.bytes_sent.fetch_add(frame.len() as u64, Ordering::Relaxed);
    Ok(())
}

async fn read_loop<R>(
    channel: NetworkChannel,
    mut reader: R,
    mut decoder: Decoder,
    inbound: mpsc::UnboundedSender<Packet>,
) where
    R: AsyncRead + Unpin,
{
    let mut shutdown = channel.inner.shutdown.subscribe();
    let mut read_buf = BytesMut::with_capacity(4096);

    let reason = loop {
        // Drain every complete frame before reading more
        match decoder.decode(&mut read_buf) {
            Ok(Some(packet)) => {
                channel.handle_inbound(packet, &inbound);
                continue;
            }
            Ok(None) => {}
            Err(e) => {
                // Framing can no longer be trusted
                tracing::warn!("Channel {} protocol error: {}", channel.id(), e);
                break format!("Protocol error: {}", e);
            }
        }

        tokio::select! {
            result = reader.read_buf(&mut read_buf) => {
                match result {
                    Ok(0) if read_buf.is_empty() => break "Connection closed".to_string(),
                    Ok(0) => break "Connection closed mid-frame".to_string(),
                    Ok(n) => {
                        channel.inner.stats.bytes_received.fetch_add(n as u64, Ordering::Relaxed);
                    }
                    Err(e) => break format!("IO error: {}", e),
                }
            }
            _ = closed_signal(&mut shutdown) => break "Channel closed".to_string(),
        }
    };

    tracing::debug!("Channel {} read loop ended: {}", channel.id(), reason);
    channel.close();
}

/// Runs listeners on the blocking pool, one packet at a time, so packets
/// are handled in arrival order without stalling the read loop.
async fn dispatch_loop(channel: NetworkChannel, mut inbound: mpsc::UnboundedReceiver<Packet>) {
    while let Some(packet) = inbound.recv().await {
        let worker = channel.clone();
        let result = tokio::task::spawn_blocking(move || {
            let registry = worker.registry().clone();
            registry.dispatch(&worker, &packet)
        })
        .await;

        if let Err(e) = result {
            tracing::error!("Channel {} dispatch worker failed: {}", channel.id(), e);
        }
    }
}
