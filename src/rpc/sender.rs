//! Calling side of RPC

use std::time::Duration;

use super::{decode_reply, RpcInvocation, RpcResult};
use crate::buffer::{Decode, Encode};
use crate::network::NetworkChannel;
use crate::protocol::{channels, Packet};

/// Proxy for one remote target reachable over a channel.
///
/// Typed proxies wrap a sender and expose one method per remote method:
///
/// ```ignore
/// struct CalculatorProxy(RpcSender);
///
/// impl CalculatorProxy {
///     async fn add(&self, a: i32, b: i32) -> RpcResult<i32> {
///         self.0.invoke("add").arg(&a).arg(&b).call().await
///     }
/// }
/// ```
#[derive(Debug, Clone)]
pub struct RpcSender {
    target: String,
    channel: NetworkChannel,
    timeout: Duration,
}

impl RpcSender {
    /// Bind to `target` on `channel`, using the channel's default query timeout
    pub fn new(target: impl Into<String>, channel: NetworkChannel) -> Self {
        let timeout = channel.default_query_timeout();
        Self {
            target: target.into(),
            channel,
            timeout,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn channel(&self) -> &NetworkChannel {
        &self.channel
    }

    /// Start building a call to `method`
    pub fn invoke(&self, method: impl Into<String>) -> RpcCall<'_> {
        RpcCall {
            sender: self,
            invocation: RpcInvocation::new(self.target.clone(), method),
            timeout: self.timeout,
        }
    }
}

/// A call being assembled; finish it with `call`, `call_blocking` or `fire`
#[must_use = "a call does nothing until it is sent"]
pub struct RpcCall<'a> {
    sender: &'a RpcSender,
    invocation: RpcInvocation,
    timeout: Duration,
}

impl RpcCall<'_> {
    pub fn arg<T: Encode + ?Sized>(mut self, value: &T) -> Self {
        self.invocation.push_argument(value);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Send as a query and await the decoded result
    pub async fn call<T: Decode>(self) -> RpcResult<T> {
        let channel = &self.sender.channel;
        let response = channel.query(self.packet(), self.timeout).await?;
        decode_result(&response)
    }

    /// Like `call`, blocking the current thread.
    ///
    /// Must not be called from within an async context.
    pub fn call_blocking<T: Decode>(self) -> RpcResult<T> {
        let channel = &self.sender.channel;
        let response = channel.send_query(self.packet(), self.timeout)?;
        decode_result(&response)
    }

    /// Send without waiting for a reply. Remote failures are only logged
    /// on the receiving side.
    pub fn fire(mut self) -> RpcResult<()> {
        self.invocation.expects_result = false;
        let packet = Packet::new(channels::RPC, self.invocation.encode());
        self.sender.channel.send(packet)?;
        Ok(())
    }

    fn packet(&self) -> Packet {
        Packet::new_query(channels::RPC, self.invocation.encode())
    }
}

fn decode_result<T: Decode>(response: &Packet) -> RpcResult<T> {
    let mut result = decode_reply(&mut response.content())?;
    Ok(T::decode(&mut result)?)
}
