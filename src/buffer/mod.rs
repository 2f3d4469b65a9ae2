//! Buffer module - Binary codec used for every packet payload
//!
//! Values are written and read back in strict order with no type tags:
//! - Fixed-width numbers are big-endian
//! - Byte arrays, strings and nested buffers carry a var int length prefix
//! - Unique ids are two 64-bit halves (most significant first)
//!
//! [`DataBufMut`] is the writable view; [`DataBufMut::freeze`] turns it into
//! an immutable [`DataBuf`] that shares the same bytes.

mod immutable;
mod mapper;
mod mutable;
mod value;
pub mod varint;

pub use immutable::*;
pub use mapper::*;
pub use mutable::*;
pub use value::*;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use thiserror::Error;
use uuid::Uuid;

/// Buffer errors
#[derive(Error, Debug)]
pub enum BufferError {
    #[error("Buffer underflow: needed {needed} bytes, {remaining} remaining")]
    Underflow { needed: usize, remaining: usize },

    #[error("Variable-length integer is too long")]
    VarIntTooLong,

    #[error("Invalid UTF-8 string: {0}")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),

    #[error("Invalid char scalar value: {0:#x}")]
    InvalidChar(u32),

    #[error("Object mapping error: {0}")]
    Object(String),
}

pub type BufferResult<T> = Result<T, BufferError>;

/// Read access shared by the immutable and the mutable buffer.
///
/// Implementors provide cursor handling and transactions; every typed read
/// is built on top of those.
pub trait DataRead {
    /// Number of bytes left between the read cursor and the end of the data
    fn readable_bytes(&self) -> usize;

    /// The unread bytes
    fn chunk(&self) -> &[u8];

    /// Move the read cursor forward. Callers check bounds first.
    fn advance_reader(&mut self, cnt: usize);

    /// Take the next `len` bytes as an owned slice
    fn read_raw(&mut self, len: usize) -> BufferResult<Bytes>;

    /// Snapshot the cursors so a later [`DataRead::redo_transaction`] can
    /// restore them. Transactions nest.
    fn start_transaction(&mut self);

    /// Restore the state captured by the latest [`DataRead::start_transaction`].
    /// Does nothing when no transaction is open.
    fn redo_transaction(&mut self);

    fn ensure_readable(&self, needed: usize) -> BufferResult<()> {
        let remaining = self.readable_bytes();
        if remaining < needed {
            return Err(BufferError::Underflow { needed, remaining });
        }
        Ok(())
    }

    fn take_array<const N: usize>(&mut self) -> BufferResult<[u8; N]>
    where
        Self: Sized,
    {
        self.ensure_readable(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(&self.chunk()[..N]);
        self.advance_reader(N);
        Ok(out)
    }

    fn read_bool(&mut self) -> BufferResult<bool>
    where
        Self: Sized,
    {
        Ok(self.read_u8()? != 0)
    }

    fn read_u8(&mut self) -> BufferResult<u8>
    where
        Self: Sized,
    {
        Ok(self.take_array::<1>()?[0])
    }

    fn read_i8(&mut self) -> BufferResult<i8>
    where
        Self: Sized,
    {
        Ok(i8::from_be_bytes(self.take_array()?))
    }

    fn read_i16(&mut self) -> BufferResult<i16>
    where
        Self: Sized,
    {
        Ok(i16::from_be_bytes(self.take_array()?))
    }

    fn read_u16(&mut self) -> BufferResult<u16>
    where
        Self: Sized,
    {
        Ok(u16::from_be_bytes(self.take_array()?))
    }

    fn read_i32(&mut self) -> BufferResult<i32>
    where
        Self: Sized,
    {
        Ok(i32::from_be_bytes(self.take_array()?))
    }

    fn read_u32(&mut self) -> BufferResult<u32>
    where
        Self: Sized,
    {
        Ok(u32::from_be_bytes(self.take_array()?))
    }

    fn read_i64(&mut self) -> BufferResult<i64>
    where
        Self: Sized,
    {
        Ok(i64::from_be_bytes(self.take_array()?))
    }

    fn read_u64(&mut self) -> BufferResult<u64>
    where
        Self: Sized,
    {
        Ok(u64::from_be_bytes(self.take_array()?))
    }

    fn read_f32(&mut self) -> BufferResult<f32>
    where
        Self: Sized,
    {
        Ok(f32::from_be_bytes(self.take_array()?))
    }

    fn read_f64(&mut self) -> BufferResult<f64>
    where
        Self: Sized,
    {
        Ok(f64::from_be_bytes(self.take_array()?))
    }

    fn read_char(&mut self) -> BufferResult<char>
    where
        Self: Sized,
    {
        let scalar = self.read_u32()?;
        char::from_u32(scalar).ok_or(BufferError::InvalidChar(scalar))
    }

    fn read_var_int(&mut self) -> BufferResult<u32>
    where
        Self: Sized,
    {
        match varint::peek_var_int(self.chunk())? {
            Some((value, len)) => {
                self.advance_reader(len);
                Ok(value)
            }
            None => Err(BufferError::Underflow {
                needed: self.readable_bytes() + 1,
                remaining: self.readable_bytes(),
            }),
        }
    }

    fn read_var_long(&mut self) -> BufferResult<u64>
    where
        Self: Sized,
    {
        match varint::peek_var_long(self.chunk())? {
            Some((value, len)) => {
                self.advance_reader(len);
                Ok(value)
            }
            None => Err(BufferError::Underflow {
                needed: self.readable_bytes() + 1,
                remaining: self.readable_bytes(),
            }),
        }
    }

    /// Read a length-prefixed byte array without copying where possible
    fn read_bytes(&mut self) -> BufferResult<Bytes>
    where
        Self: Sized,
    {
        let len = self.read_var_int()? as usize;
        self.read_raw(len)
    }

    fn read_byte_array(&mut self) -> BufferResult<Vec<u8>>
    where
        Self: Sized,
    {
        Ok(self.read_bytes()?.to_vec())
    }

    fn read_string(&mut self) -> BufferResult<String>
    where
        Self: Sized,
    {
        Ok(String::from_utf8(self.read_byte_array()?)?)
    }

    fn read_unique_id(&mut self) -> BufferResult<Uuid>
    where
        Self: Sized,
    {
        let most = self.read_u64()?;
        let least = self.read_u64()?;
        Ok(Uuid::from_u64_pair(most, least))
    }

    /// Read a nested buffer written by [`DataBufMut::write_data_buf`]
    fn read_data_buf(&mut self) -> BufferResult<DataBuf>
    where
        Self: Sized,
    {
        Ok(DataBuf::from(self.read_bytes()?))
    }

    /// Read a value written by [`DataBufMut::write_nullable`]
    fn read_nullable<T, F>(&mut self, read: F) -> BufferResult<Option<T>>
    where
        Self: Sized,
        F: FnOnce(&mut Self) -> BufferResult<T>,
    {
        if self.read_bool()? {
            Ok(Some(read(self)?))
        } else {
            Ok(None)
        }
    }

    fn read_value<T: Decode>(&mut self) -> BufferResult<T>
    where
        Self: Sized,
    {
        T::decode(self)
    }

    /// Read an object with the default [`BincodeMapper`]
    fn read_object<T: DeserializeOwned>(&mut self) -> BufferResult<T>
    where
        Self: Sized,
    {
        BincodeMapper.read_object(self)
    }

    fn read_object_with<M, T>(&mut self, mapper: &M) -> BufferResult<T>
    where
        Self: Sized,
        M: ObjectMapper,
        T: DeserializeOwned,
    {
        mapper.read_object(self)
    }
}
