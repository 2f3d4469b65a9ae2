//! Protocol module - Packets and the wire protocol for NodeLink communication
//!
//! Every frame on the wire is length-prefixed:
//! - var int frame length
//! - 4 bytes routing channel (big-endian)
//! - 1 byte correlation flag, followed by a 16 byte correlation id when set
//! - var int payload length
//! - Variable length payload

mod codec;
mod packet;
mod query;
mod registry;

pub use codec::*;
pub use packet::*;
pub use query::*;
pub use registry::*;

/// Protocol version for compatibility checking
pub const PROTOCOL_VERSION: u32 = 1;

/// Default port for NodeLink communication
pub const DEFAULT_PORT: u16 = 1410;

/// Reserved routing channels
pub mod channels {
    /// Responses built with [`super::Packet::response`] travel on this channel
    pub const QUERY_RESPONSE: i32 = -1;

    /// Remote method invocations
    pub const RPC: i32 = 0;
}
