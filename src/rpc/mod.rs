//! Remote procedure calls over network channels
//!
//! Invocations are encoded into packets on [`channels::RPC`] and sent as
//! queries, so calls inherit correlation, timeouts and cancellation from the
//! query manager. The receiving side resolves `(target, method)` through an
//! explicit [`RpcHandlerRegistry`].
//!
//! [`channels::RPC`]: crate::protocol::channels::RPC

mod descriptor;
mod handler;
mod sender;

pub use descriptor::*;
pub use handler::*;
pub use sender::*;

use thiserror::Error;

use crate::buffer::BufferError;
use crate::network::ChannelError;
use crate::protocol::{PacketError, QueryError};

/// RPC errors
#[derive(Error, Debug)]
pub enum RpcError {
    /// The peer could not resolve or execute the method
    #[error("Remote invocation failed: {0}")]
    RemoteInvocation(String),

    #[error("Query failed: {0}")]
    Query(#[from] QueryError),

    #[error("Channel error: {0}")]
    Channel(ChannelError),

    #[error("Malformed RPC payload: {0}")]
    Buffer(#[from] BufferError),

    #[error("Invalid packet: {0}")]
    Packet(#[from] PacketError),
}

pub type RpcResult<T> = Result<T, RpcError>;

impl From<ChannelError> for RpcError {
    fn from(err: ChannelError) -> Self {
        match err {
            ChannelError::Query(err) => RpcError::Query(err),
            other => RpcError::Channel(other),
        }
    }
}
