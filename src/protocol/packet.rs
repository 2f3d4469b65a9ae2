//! Packet envelope
//!
//! A packet is a routing channel plus a frozen payload. Queries and their
//! responses additionally carry a correlation id.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use thiserror::Error;
use uuid::Uuid;

use super::channels;
use crate::buffer::DataBuf;

/// Packet errors
#[derive(Error, Debug)]
pub enum PacketError {
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}

pub type PacketResult<T> = Result<T, PacketError>;

/// Immutable message envelope
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    channel: i32,
    unique_id: Option<Uuid>,
    content: DataBuf,
    /// Not transmitted; set locally when the packet is built or decoded
    creation_millis: u64,
}

impl Packet {
    /// Create a fire-and-forget packet
    pub fn new(channel: i32, content: DataBuf) -> Self {
        Self::with_unique_id(channel, None, content)
    }

    /// Create a query packet with a fresh correlation id
    pub fn new_query(channel: i32, content: DataBuf) -> Self {
        Self::with_unique_id(channel, Some(Uuid::new_v4()), content)
    }

    pub(crate) fn with_unique_id(channel: i32, unique_id: Option<Uuid>, content: DataBuf) -> Self {
        Self {
            channel,
            unique_id,
            content,
            creation_millis: now_millis(),
        }
    }

    /// Build the response to this packet.
    ///
    /// The response copies this packet's correlation id, which is the only
    /// thing routing it back to the asker. Fails for packets that are not
    /// queries.
    pub fn response(&self, content: DataBuf) -> PacketResult<Packet> {
        match self.unique_id {
            Some(id) => Ok(Self::with_unique_id(channels::QUERY_RESPONSE, Some(id), content)),
            None => Err(PacketError::InvalidOperation(format!(
                "cannot build a response to a packet without correlation id (channel {})",
                self.channel
            ))),
        }
    }

    /// Same packet with a new correlation id
    pub(crate) fn into_query(self, unique_id: Uuid) -> Self {
        Self {
            unique_id: Some(unique_id),
            ..self
        }
    }

    pub fn channel(&self) -> i32 {
        self.channel
    }

    pub fn unique_id(&self) -> Option<Uuid> {
        self.unique_id
    }

    pub fn is_query(&self) -> bool {
        self.unique_id.is_some()
    }

    /// The payload with a fresh read cursor
    pub fn content(&self) -> DataBuf {
        self.content.clone()
    }

    pub(crate) fn content_ref(&self) -> &DataBuf {
        &self.content
    }

    /// Milliseconds since the Unix epoch at creation time
    pub fn creation_millis(&self) -> u64 {
        self.creation_millis
    }

    pub fn created_at(&self) -> SystemTime {
        UNIX_EPOCH + Duration::from_millis(self.creation_millis)
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{DataBufMut, DataRead};

    fn payload(text: &str) -> DataBuf {
        let mut buf = DataBufMut::new();
        buf.write_string(text);
        buf.freeze()
    }

    #[test]
    fn test_plain_packet_has_no_id() {
        let packet = Packet::new(5, payload("hello"));
        assert_eq!(packet.channel(), 5);
        assert!(!packet.is_query());
        assert!(packet.creation_millis() > 0);
    }

    #[test]
    fn test_query_ids_are_fresh() {
        let a = Packet::new_query(5, DataBuf::empty());
        let b = Packet::new_query(5, DataBuf::empty());
        assert!(a.unique_id().is_some());
        assert_ne!(a.unique_id(), b.unique_id());
    }

    #[test]
    fn test_response_copies_correlation_id() {
        let request = Packet::new_query(5, payload("ping"));
        let response = request.response(payload("pong")).unwrap();
        assert_eq!(response.unique_id(), request.unique_id());
        assert_eq!(response.channel(), channels::QUERY_RESPONSE);
        assert_eq!(response.content().read_string().unwrap(), "pong");
    }

    #[test]
    fn test_response_to_plain_packet_is_invalid() {
        let packet = Packet::new(5, DataBuf::empty());
        let err = tokio_test::assert_err!(packet.response(DataBuf::empty()));
        assert!(matches!(err, PacketError::InvalidOperation(_)));
    }

    #[test]
    fn test_content_does_not_consume_payload() {
        let packet = Packet::new(1, payload("twice"));
        assert_eq!(packet.content().read_string().unwrap(), "twice");
        assert_eq!(packet.content().read_string().unwrap(), "twice");
    }
}
