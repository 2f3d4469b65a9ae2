//! NodeLink - Packet transport, query correlation and RPC for cluster nodes
//!
//! Nodes exchange length-prefixed packets over TCP. A packet is routed by
//! its channel number to registered listeners, may carry a correlation id
//! to be answered as a query, and can carry remote method invocations.

pub mod buffer;
pub mod config;
pub mod network;
pub mod protocol;
pub mod rpc;
