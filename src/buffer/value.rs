//! Typed values that know how to write and read themselves

use bytes::Bytes;
use uuid::Uuid;

use super::mutable::length_prefix;
use super::{BufferResult, DataBuf, DataBufMut, DataRead};

/// A value with a fixed buffer encoding
pub trait Encode {
    fn encode(&self, buf: &mut DataBufMut);
}

/// Inverse of [`Encode`]
pub trait Decode: Sized {
    fn decode<R: DataRead>(buf: &mut R) -> BufferResult<Self>;
}

macro_rules! impl_primitive {
    ($($ty:ty => $write:ident, $read:ident;)*) => {
        $(
            impl Encode for $ty {
                fn encode(&self, buf: &mut DataBufMut) {
                    buf.$write(*self);
                }
            }

            impl Decode for $ty {
                fn decode<R: DataRead>(buf: &mut R) -> BufferResult<Self> {
                    buf.$read()
                }
            }
        )*
    };
}

impl_primitive! {
    bool => write_bool, read_bool;
    u8 => write_u8, read_u8;
    i8 => write_i8, read_i8;
    i16 => write_i16, read_i16;
    u16 => write_u16, read_u16;
    i32 => write_i32, read_i32;
    u32 => write_u32, read_u32;
    i64 => write_i64, read_i64;
    u64 => write_u64, read_u64;
    f32 => write_f32, read_f32;
    f64 => write_f64, read_f64;
    char => write_char, read_char;
    Uuid => write_unique_id, read_unique_id;
}

impl Encode for () {
    fn encode(&self, _buf: &mut DataBufMut) {}
}

impl Decode for () {
    fn decode<R: DataRead>(_buf: &mut R) -> BufferResult<Self> {
        Ok(())
    }
}

impl Encode for str {
    fn encode(&self, buf: &mut DataBufMut) {
        buf.write_string(self);
    }
}

impl Encode for String {
    fn encode(&self, buf: &mut DataBufMut) {
        buf.write_string(self);
    }
}

impl Decode for String {
    fn decode<R: DataRead>(buf: &mut R) -> BufferResult<Self> {
        buf.read_string()
    }
}

/// Raw byte arrays
impl Encode for Bytes {
    fn encode(&self, buf: &mut DataBufMut) {
        buf.write_byte_array(self);
    }
}

impl Decode for Bytes {
    fn decode<R: DataRead>(buf: &mut R) -> BufferResult<Self> {
        buf.read_bytes()
    }
}

impl Encode for DataBuf {
    fn encode(&self, buf: &mut DataBufMut) {
        // Encoding must not disturb the caller's cursor
        let mut source = self.clone();
        buf.write_data_buf(&mut source);
    }
}

impl Decode for DataBuf {
    fn decode<R: DataRead>(buf: &mut R) -> BufferResult<Self> {
        buf.read_data_buf()
    }
}

impl<T: Encode> Encode for Option<T> {
    fn encode(&self, buf: &mut DataBufMut) {
        buf.write_nullable(self.as_ref(), |buf, value| value.encode(buf));
    }
}

impl<T: Decode> Decode for Option<T> {
    fn decode<R: DataRead>(buf: &mut R) -> BufferResult<Self> {
        buf.read_nullable(|buf| T::decode(buf))
    }
}

/// Var int element count followed by the elements
impl<T: Encode> Encode for Vec<T> {
    fn encode(&self, buf: &mut DataBufMut) {
        buf.write_var_int(length_prefix(self.len()));
        for item in self {
            item.encode(buf);
        }
    }
}

impl<T: Decode> Decode for Vec<T> {
    fn decode<R: DataRead>(buf: &mut R) -> BufferResult<Self> {
        let len = buf.read_var_int()? as usize;
        // Every element takes at least one byte, except for zero-sized ones
        let mut items = Vec::with_capacity(len.min(buf.readable_bytes()));
        for _ in 0..len {
            items.push(T::decode(buf)?);
        }
        Ok(items)
    }
}

impl<T: Encode + ?Sized> Encode for &T {
    fn encode(&self, buf: &mut DataBufMut) {
        (**self).encode(buf);
    }
}
