//! Packet listener registry
//!
//! Maps routing channels to the listeners interested in them.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use super::Packet;
use crate::network::NetworkChannel;

/// Identifies one registration, used to unregister it again
pub type ListenerId = u64;

/// Receives packets for the channels it is registered on
pub trait PacketListener: Send + Sync + 'static {
    fn handle(&self, channel: &NetworkChannel, packet: &Packet) -> anyhow::Result<()>;
}

impl<F> PacketListener for F
where
    F: Fn(&NetworkChannel, &Packet) -> anyhow::Result<()> + Send + Sync + 'static,
{
    fn handle(&self, channel: &NetworkChannel, packet: &Packet) -> anyhow::Result<()> {
        self(channel, packet)
    }
}

#[derive(Clone)]
struct ListenerEntry {
    id: ListenerId,
    listener: Arc<dyn PacketListener>,
}

/// Registry of packet listeners, optionally backed by a parent registry.
///
/// A channel's own registry is usually a child of the registry shared by
/// its server or client; dispatch runs the child's listeners first and then
/// the parent's.
#[derive(Default)]
pub struct PacketListenerRegistry {
    parent: Option<Arc<PacketListenerRegistry>>,
    listeners: RwLock<HashMap<i32, Vec<ListenerEntry>>>,
    next_id: AtomicU64,
}

impl PacketListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry that falls back to `parent`
    pub fn with_parent(parent: Arc<PacketListenerRegistry>) -> Self {
        Self {
            parent: Some(parent),
            ..Self::default()
        }
    }

    pub fn parent(&self) -> Option<&Arc<PacketListenerRegistry>> {
        self.parent.as_ref()
    }

    /// Add a listener for `channel`; several listeners may share a channel
    pub fn register<L: PacketListener>(&self, channel: i32, listener: L) -> ListenerId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let entry = ListenerEntry {
            id,
            listener: Arc::new(listener),
        };

        self.write().entry(channel).or_default().push(entry);
        id
    }

    /// Remove one registration. Returns false if it was not found.
    pub fn unregister(&self, channel: i32, id: ListenerId) -> bool {
        let mut listeners = self.write();
        let Some(entries) = listeners.get_mut(&channel) else {
            return false;
        };

        let before = entries.len();
        entries.retain(|entry| entry.id != id);
        let removed = entries.len() != before;
        if entries.is_empty() {
            listeners.remove(&channel);
        }
        removed
    }

    /// Remove every listener of `channel`
    pub fn unregister_channel(&self, channel: i32) -> usize {
        self.write().remove(&channel).map_or(0, |entries| entries.len())
    }

    /// Whether this registry or its parent has a listener for `channel`
    pub fn has_listeners(&self, channel: i32) -> bool {
        self.read().contains_key(&channel)
            || self
                .parent
                .as_ref()
                .is_some_and(|parent| parent.has_listeners(channel))
    }

    /// Channels with at least one local listener
    pub fn channels(&self) -> Vec<i32> {
        let mut channels: Vec<i32> = self.read().keys().copied().collect();
        channels.sort_unstable();
        channels
    }

    /// Deliver `packet` to every listener of its channel, in registration
    /// order, then to the parent registry and its own ancestors.
    ///
    /// Works on a snapshot taken up front, so concurrent (un)registration
    /// never causes a listener to be skipped or run twice. A failing or
    /// panicking listener is logged and does not stop the others. Returns
    /// the number of listeners invoked.
    pub fn dispatch(&self, channel: &NetworkChannel, packet: &Packet) -> usize {
        let invoked = self.dispatch_chain(channel, packet);

        if invoked == 0 {
            if packet.is_query() {
                tracing::debug!(
                    "Dropping packet on channel {} with correlation id {:?}: no listener or pending query",
                    packet.channel(),
                    packet.unique_id()
                );
            } else {
                tracing::debug!("Dropping packet on channel {}: no listener", packet.channel());
            }
        }
        invoked
    }

    /// This registry's listeners, then every ancestor's
    fn dispatch_chain(&self, channel: &NetworkChannel, packet: &Packet) -> usize {
        self.dispatch_local(channel, packet)
            + self
                .parent
                .as_ref()
                .map_or(0, |parent| parent.dispatch_chain(channel, packet))
    }

    fn dispatch_local(&self, channel: &NetworkChannel, packet: &Packet) -> usize {
        let snapshot = match self.read().get(&packet.channel()) {
            Some(entries) => entries.clone(),
            None => return 0,
        };

        for entry in &snapshot {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| entry.listener.handle(channel, packet)));
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::warn!(
                        "Listener {} on channel {} failed: {:#}",
                        entry.id,
                        packet.channel(),
                        e
                    );
                }
                Err(_) => {
                    tracing::error!("Listener {} on channel {} panicked", entry.id, packet.channel());
                }
            }
        }
        snapshot.len()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<i32, Vec<ListenerEntry>>> {
        self.listeners.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<i32, Vec<ListenerEntry>>> {
        self.listeners.write().unwrap_or_else(|e| e.into_inner())
    }
}
