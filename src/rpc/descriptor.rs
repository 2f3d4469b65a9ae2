//! Wire form of invocations and their replies
//!
//! Invocation: `[target:string][method:string][expects_result:bool]
//! [argument count:varint][argument:nested buffer]*`
//!
//! Reply: `[true][result:nested buffer]` or `[false][description:string]`

use super::{RpcError, RpcResult};
use crate::buffer::{length_prefix, BufferResult, DataBuf, DataBufMut, DataRead, Encode};

/// One method call, from encoding on the caller to invocation on the peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcInvocation {
    pub target: String,
    pub method: String,
    /// Whether the caller waits for a reply
    pub expects_result: bool,
    /// Arguments, each encoded into its own buffer
    pub arguments: Vec<DataBuf>,
}

impl RpcInvocation {
    pub fn new(target: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            method: method.into(),
            expects_result: true,
            arguments: Vec::new(),
        }
    }

    /// Append an argument
    pub fn push_argument<T: Encode + ?Sized>(&mut self, value: &T) {
        let mut buf = DataBufMut::new();
        buf.write_value(value);
        self.arguments.push(buf.freeze());
    }

    /// `Target#method`, as used in log lines and error descriptions
    pub fn qualified_name(&self) -> String {
        format!("{}#{}", self.target, self.method)
    }

    pub fn encode(&self) -> DataBuf {
        let mut buf = DataBufMut::new();
        buf.write_string(&self.target)
            .write_string(&self.method)
            .write_bool(self.expects_result)
            .write_var_int(length_prefix(self.arguments.len()));
        for argument in &self.arguments {
            buf.write_data_buf(&mut argument.clone());
        }
        buf.freeze()
    }

    pub fn decode<R: DataRead>(buf: &mut R) -> BufferResult<Self> {
        let target = buf.read_string()?;
        let method = buf.read_string()?;
        let expects_result = buf.read_bool()?;
        let count = buf.read_var_int()? as usize;

        // Each argument takes at least its length prefix
        buf.ensure_readable(count)?;
        let arguments = (0..count)
            .map(|_| buf.read_data_buf())
            .collect::<BufferResult<Vec<_>>>()?;

        Ok(Self {
            target,
            method,
            expects_result,
            arguments,
        })
    }
}

/// Encode a successful reply carrying `result`
pub fn encode_success(mut result: DataBuf) -> DataBuf {
    let mut buf = DataBufMut::new();
    buf.write_bool(true).write_data_buf(&mut result);
    buf.freeze()
}

/// Encode a failed reply
pub fn encode_failure(description: &str) -> DataBuf {
    let mut buf = DataBufMut::new();
    buf.write_bool(false).write_string(description);
    buf.freeze()
}

/// Decode a reply into the encoded result or a remote invocation error
pub fn decode_reply<R: DataRead>(buf: &mut R) -> RpcResult<DataBuf> {
    if buf.read_bool()? {
        Ok(buf.read_data_buf()?)
    } else {
        Err(RpcError::RemoteInvocation(buf.read_string()?))
    }
}
