//! Receiving side of RPC: the handler table and the listener that invokes it

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, RwLock};

use anyhow::Context;

use super::{encode_failure, encode_success, RpcInvocation};
use crate::buffer::{DataBuf, DataBufMut, Decode, Encode};
use crate::network::NetworkChannel;
use crate::protocol::{channels, ListenerId, Packet, PacketListener, PacketListenerRegistry};

/// Arguments of one invocation, consumed in order
#[derive(Debug)]
pub struct RpcArguments {
    arguments: std::vec::IntoIter<DataBuf>,
    position: usize,
}

impl RpcArguments {
    pub fn new(arguments: Vec<DataBuf>) -> Self {
        Self {
            arguments: arguments.into_iter(),
            position: 0,
        }
    }

    /// Decode the next argument
    pub fn read<T: Decode>(&mut self) -> anyhow::Result<T> {
        self.position += 1;
        let mut argument = self
            .arguments
            .next()
            .with_context(|| format!("missing argument {}", self.position))?;
        T::decode(&mut argument).with_context(|| format!("malformed argument {}", self.position))
    }

    /// Arguments not consumed yet
    pub fn remaining(&self) -> usize {
        self.arguments.len()
    }
}

type BoxedHandler = Arc<dyn Fn(&mut RpcArguments) -> anyhow::Result<DataBuf> + Send + Sync>;

/// Explicit `(target, method)` to handler table
#[derive(Default)]
pub struct RpcHandlerRegistry {
    handlers: RwLock<HashMap<String, HashMap<String, BoxedHandler>>>,
}

impl RpcHandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `target#method`, replacing any previous one
    pub fn register<F, R>(&self, target: impl Into<String>, method: impl Into<String>, handler: F)
    where
        F: Fn(&mut RpcArguments) -> anyhow::Result<R> + Send + Sync + 'static,
        R: Encode,
    {
        let boxed: BoxedHandler = Arc::new(move |arguments: &mut RpcArguments| {
            let value = handler(arguments)?;
            let mut buf = DataBufMut::new();
            buf.write_value(&value);
            Ok(buf.freeze())
        });

        let mut handlers = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        handlers.entry(target.into()).or_default().insert(method.into(), boxed);
    }

    pub fn unregister(&self, target: &str, method: &str) -> bool {
        let mut handlers = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        let Some(methods) = handlers.get_mut(target) else {
            return false;
        };

        let removed = methods.remove(method).is_some();
        if methods.is_empty() {
            handlers.remove(target);
        }
        removed
    }

    /// Remove every method of `target`
    pub fn unregister_target(&self, target: &str) -> usize {
        let mut handlers = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        handlers.remove(target).map_or(0, |methods| methods.len())
    }

    pub fn has_method(&self, target: &str, method: &str) -> bool {
        self.resolve(target, method).is_some()
    }

    /// Registered targets, sorted
    pub fn targets(&self) -> Vec<String> {
        let handlers = self.handlers.read().unwrap_or_else(|e| e.into_inner());
        let mut targets: Vec<String> = handlers.keys().cloned().collect();
        targets.sort();
        targets
    }

    fn resolve(&self, target: &str, method: &str) -> Option<BoxedHandler> {
        let handlers = self.handlers.read().unwrap_or_else(|e| e.into_inner());
        handlers.get(target)?.get(method).cloned()
    }

    /// Run an invocation. The error is a description for the caller.
    pub fn invoke(&self, invocation: &RpcInvocation) -> Result<DataBuf, String> {
        let name = invocation.qualified_name();
        let handler = self
            .resolve(&invocation.target, &invocation.method)
            .ok_or_else(|| format!("method not found: {}", name))?;

        let mut arguments = RpcArguments::new(invocation.arguments.clone());
        match panic::catch_unwind(AssertUnwindSafe(|| handler(&mut arguments))) {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(e)) => Err(format!("{} failed: {:#}", name, e)),
            Err(_) => Err(format!("{} panicked", name)),
        }
    }

    /// Serve this table on the RPC channel of `registry`
    pub fn install(self: &Arc<Self>, registry: &PacketListenerRegistry) -> ListenerId {
        registry.register(channels::RPC, RpcInvocationListener::new(self.clone()))
    }
}

/// Packet listener that decodes invocations, runs them and replies
pub struct RpcInvocationListener {
    handlers: Arc<RpcHandlerRegistry>,
}

impl RpcInvocationListener {
    pub fn new(handlers: Arc<RpcHandlerRegistry>) -> Self {
        Self { handlers }
    }
}

impl PacketListener for RpcInvocationListener {
    fn handle(&self, channel: &NetworkChannel, packet: &Packet) -> anyhow::Result<()> {
        let invocation = match RpcInvocation::decode(&mut packet.content()) {
            Ok(invocation) => invocation,
            Err(e) => {
                // Answer instead of leaving the caller to time out
                if packet.is_query() {
                    channel.send(packet.response(encode_failure(&format!("malformed invocation: {}", e)))?)?;
                }
                return Err(e).context("malformed RPC invocation");
            }
        };

        tracing::debug!("Invoking {} for channel {}", invocation.qualified_name(), channel.id());
        let outcome = self.handlers.invoke(&invocation);

        if !(invocation.expects_result && packet.is_query()) {
            if let Err(description) = outcome {
                tracing::warn!("One-way invocation failed: {}", description);
            }
            return Ok(());
        }

        let reply = match outcome {
            Ok(result) => encode_success(result),
            Err(description) => {
                tracing::debug!("Invocation failed: {}", description);
                encode_failure(&description)
            }
        };
        channel.send(packet.response(reply)?)?;
        Ok(())
    }
}
