//! Writable buffer

use bytes::{BufMut, Bytes, BytesMut};
use serde::Serialize;
use uuid::Uuid;

use super::varint;
use super::{BincodeMapper, BufferError, BufferResult, DataBuf, DataRead, Encode, ObjectMapper};

/// Growable buffer supporting both writes and reads.
///
/// Every write appends at the end and returns `&mut Self` for chaining.
/// Once writing is finished, [`DataBufMut::freeze`] hands the bytes over to
/// an immutable [`DataBuf`] without copying.
#[derive(Debug, Default)]
pub struct DataBufMut {
    bytes: BytesMut,
    read_pos: usize,
    /// (read position, write position) per open transaction
    marks: Vec<(usize, usize)>,
}

/// Convert a length to its var int prefix.
///
/// Lengths on the wire are u32. Anything written into a packet is bounded
/// by the frame size limit long before that, so a larger length is a bug
/// in the caller.
pub(crate) fn length_prefix(len: usize) -> u32 {
    debug_assert!(u32::try_from(len).is_ok(), "length {} does not fit a u32 prefix", len);
    u32::try_from(len).unwrap_or(u32::MAX)
}

impl DataBufMut {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            bytes: BytesMut::with_capacity(capacity),
            read_pos: 0,
            marks: Vec::new(),
        }
    }

    /// Current write position (number of bytes written)
    pub fn writer_index(&self) -> usize {
        self.bytes.len()
    }

    pub fn reader_index(&self) -> usize {
        self.read_pos
    }

    /// Turn this buffer into an immutable one over the same bytes.
    /// The read cursor carries over.
    pub fn freeze(self) -> DataBuf {
        let read_pos = self.read_pos;
        let mut frozen = DataBuf::from(self.bytes.freeze());
        frozen.advance_reader(read_pos);
        frozen
    }

    pub fn write_bool(&mut self, value: bool) -> &mut Self {
        self.bytes.put_u8(u8::from(value));
        self
    }

    pub fn write_u8(&mut self, value: u8) -> &mut Self {
        self.bytes.put_u8(value);
        self
    }

    pub fn write_i8(&mut self, value: i8) -> &mut Self {
        self.bytes.put_i8(value);
        self
    }

    pub fn write_i16(&mut self, value: i16) -> &mut Self {
        self.bytes.put_i16(value);
        self
    }

    pub fn write_u16(&mut self, value: u16) -> &mut Self {
        self.bytes.put_u16(value);
        self
    }

    pub fn write_i32(&mut self, value: i32) -> &mut Self {
        self.bytes.put_i32(value);
        self
    }

    pub fn write_u32(&mut self, value: u32) -> &mut Self {
        self.bytes.put_u32(value);
        self
    }

    pub fn write_i64(&mut self, value: i64) -> &mut Self {
        self.bytes.put_i64(value);
        self
    }

    pub fn write_u64(&mut self, value: u64) -> &mut Self {
        self.bytes.put_u64(value);
        self
    }

    pub fn write_f32(&mut self, value: f32) -> &mut Self {
        self.bytes.put_f32(value);
        self
    }

    pub fn write_f64(&mut self, value: f64) -> &mut Self {
        self.bytes.put_f64(value);
        self
    }

    pub fn write_char(&mut self, value: char) -> &mut Self {
        self.bytes.put_u32(u32::from(value));
        self
    }

    pub fn write_var_int(&mut self, value: u32) -> &mut Self {
        varint::put_var_int(&mut self.bytes, value);
        self
    }

    pub fn write_var_long(&mut self, value: u64) -> &mut Self {
        varint::put_var_long(&mut self.bytes, value);
        self
    }

    /// Write a length-prefixed byte array
    pub fn write_byte_array(&mut self, value: &[u8]) -> &mut Self {
        self.write_var_int(length_prefix(value.len()));
        self.bytes.put_slice(value);
        self
    }

    pub fn write_string(&mut self, value: &str) -> &mut Self {
        self.write_byte_array(value.as_bytes())
    }

    pub fn write_unique_id(&mut self, value: Uuid) -> &mut Self {
        let (most, least) = value.as_u64_pair();
        self.write_u64(most).write_u64(least)
    }

    /// Append raw bytes with no length prefix
    pub fn write_raw(&mut self, value: &[u8]) -> &mut Self {
        self.bytes.put_slice(value);
        self
    }

    /// Embed the readable part of `source` as a nested buffer.
    ///
    /// `source` is read inside a transaction and rolled back afterwards, so
    /// its holder can still read it.
    pub fn write_data_buf<B: DataRead>(&mut self, source: &mut B) -> &mut Self {
        source.start_transaction();
        let len = source.readable_bytes();
        let content = source.read_raw(len).unwrap_or_default();
        self.write_byte_array(&content);
        source.redo_transaction();
        self
    }

    /// Write a presence flag followed by the value when present
    pub fn write_nullable<T, F>(&mut self, value: Option<T>, write: F) -> &mut Self
    where
        F: FnOnce(&mut Self, T),
    {
        self.write_bool(value.is_some());
        if let Some(value) = value {
            write(self, value);
        }
        self
    }

    pub fn write_value<T: Encode + ?Sized>(&mut self, value: &T) -> &mut Self {
        value.encode(self);
        self
    }

    /// Write an object with the default [`BincodeMapper`]
    pub fn write_object<T: Serialize + ?Sized>(&mut self, value: &T) -> BufferResult<&mut Self> {
        self.write_object_with(&BincodeMapper, value)
    }

    pub fn write_object_with<M, T>(&mut self, mapper: &M, value: &T) -> BufferResult<&mut Self>
    where
        M: ObjectMapper,
        T: Serialize + ?Sized,
    {
        mapper.write_object(self, value)?;
        Ok(self)
    }
}

impl From<&[u8]> for DataBufMut {
    fn from(value: &[u8]) -> Self {
        Self {
            bytes: BytesMut::from(value),
            read_pos: 0,
            marks: Vec::new(),
        }
    }
}

impl DataRead for DataBufMut {
    fn readable_bytes(&self) -> usize {
        self.bytes.len() - self.read_pos
    }

    fn chunk(&self) -> &[u8] {
        &self.bytes[self.read_pos..]
    }

    fn advance_reader(&mut self, cnt: usize) {
        self.read_pos = (self.read_pos + cnt).min(self.bytes.len());
    }

    fn read_raw(&mut self, len: usize) -> BufferResult<Bytes> {
        let remaining = self.readable_bytes();
        if remaining < len {
            return Err(BufferError::Underflow { needed: len, remaining });
        }
        let out = Bytes::copy_from_slice(&self.bytes[self.read_pos..self.read_pos + len]);
        self.read_pos += len;
        Ok(out)
    }

    fn start_transaction(&mut self) {
        self.marks.push((self.read_pos, self.bytes.len()));
    }

    /// Restores the read cursor and drops anything written since the mark
    fn redo_transaction(&mut self) {
        if let Some((read_pos, write_pos)) = self.marks.pop() {
            self.bytes.truncate(write_pos);
            self.read_pos = read_pos;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_primitive_roundtrip() {
        let mut buf = DataBufMut::new();
        buf.write_bool(true)
            .write_i8(-3)
            .write_i16(-1234)
            .write_u16(65_000)
            .write_i32(i32::MIN)
            .write_i64(0x0102_0304_0506_0708)
            .write_f32(1.5)
            .write_f64(-2.25)
            .write_char('λ')
            .write_string("hello")
            .write_byte_array(&[9, 8, 7])
            .write_u8(0xFE)
            .write_u32(u32::MAX)
            .write_u64(u64::MAX - 1)
            .write_var_long(0)
            .write_var_long(u64::MAX)
            .write_var_int(300);

        let written = buf.writer_index();
        let mut buf = buf.freeze();
        assert!(buf.read_bool().unwrap());
        assert_eq!(buf.read_i8().unwrap(), -3);
        assert_eq!(buf.read_i16().unwrap(), -1234);
        assert_eq!(buf.read_u16().unwrap(), 65_000);
        assert_eq!(buf.read_i32().unwrap(), i32::MIN);
        assert_eq!(buf.read_i64().unwrap(), 0x0102_0304_0506_0708);
        assert_eq!(buf.read_f32().unwrap(), 1.5);
        assert_eq!(buf.read_f64().unwrap(), -2.25);
        assert_eq!(buf.read_char().unwrap(), 'λ');
        assert_eq!(buf.read_string().unwrap(), "hello");
        assert_eq!(buf.read_byte_array().unwrap(), vec![9, 8, 7]);
        assert_eq!(buf.read_u8().unwrap(), 0xFE);
        assert_eq!(buf.read_u32().unwrap(), u32::MAX);
        assert_eq!(buf.read_u64().unwrap(), u64::MAX - 1);
        assert_eq!(buf.read_var_long().unwrap(), 0);
        assert_eq!(buf.read_var_long().unwrap(), u64::MAX);
        assert_eq!(buf.read_var_int().unwrap(), 300);
        assert_eq!(buf.reader_index(), written);
        assert_eq!(buf.readable_bytes(), 0);
    }

    #[test]
    fn test_big_endian_layout() {
        let mut buf = DataBufMut::new();
        buf.write_i32(0x0A0B_0C0D);
        assert_eq!(buf.chunk(), &[0x0A, 0x0B, 0x0C, 0x0D]);
    }

    #[test]
    fn test_unique_id_layout() {
        let id = Uuid::new_v4();
        let (most, _) = id.as_u64_pair();

        let mut buf = DataBufMut::new();
        buf.write_unique_id(id);
        assert_eq!(buf.writer_index(), 16);

        let mut buf = buf.freeze();
        assert_eq!(buf.clone().read_u64().unwrap(), most);
        assert_eq!(buf.read_unique_id().unwrap(), id);
    }

    #[test]
    fn test_length_prefix() {
        assert_eq!(length_prefix(0), 0);
        assert_eq!(length_prefix(u32::MAX as usize), u32::MAX);
    }

    #[cfg(all(debug_assertions, target_pointer_width = "64"))]
    #[test]
    #[should_panic(expected = "does not fit a u32 prefix")]
    fn test_length_prefix_rejects_oversized_length() {
        length_prefix(u32::MAX as usize + 1);
    }

    #[test]
    fn test_string_uses_short_prefix() {
        let mut buf = DataBufMut::new();
        buf.write_string("ping");
        assert_eq!(buf.writer_index(), 1 + 4);
    }

    #[test]
    fn test_nested_buffer_is_not_consumed() {
        let mut inner = DataBufMut::new();
        inner.write_i32(42).write_string("inner");
        let mut inner = inner.freeze();
        inner.read_i32().unwrap();

        let mut outer = DataBufMut::new();
        outer.write_data_buf(&mut inner).write_bool(true);

        // The source still has its unread string
        assert_eq!(inner.read_string().unwrap(), "inner");

        let mut outer = outer.freeze();
        let mut nested = outer.read_data_buf().unwrap();
        assert_eq!(nested.read_string().unwrap(), "inner");
        assert!(outer.read_bool().unwrap());
    }

    #[test]
    fn test_nullable() {
        let mut buf = DataBufMut::new();
        buf.write_nullable(Some("set"), |buf, value| {
            buf.write_string(value);
        });
        buf.write_nullable(None::<&str>, |buf, value| {
            buf.write_string(value);
        });

        let mut buf = buf.freeze();
        assert_eq!(
            buf.read_nullable(|buf| buf.read_string()).unwrap(),
            Some("set".to_string())
        );
        assert_eq!(buf.read_nullable(|buf| buf.read_string()).unwrap(), None);
    }

    #[test]
    fn test_transaction_restores_reads_and_writes() {
        let mut buf = DataBufMut::new();
        buf.write_i32(1).write_i32(2);
        buf.read_i32().unwrap();
        let before = buf.chunk().to_vec();
        let (read_before, write_before) = (buf.reader_index(), buf.writer_index());

        buf.start_transaction();
        buf.read_i32().unwrap();
        buf.write_string("scratch");
        buf.redo_transaction();

        assert_eq!(buf.reader_index(), read_before);
        assert_eq!(buf.writer_index(), write_before);
        assert_eq!(buf.chunk(), &before[..]);
    }

    #[test]
    fn test_freeze_keeps_read_cursor() {
        let mut buf = DataBufMut::new();
        buf.write_u8(1).write_u8(2);
        buf.read_u8().unwrap();
        let mut frozen = buf.freeze();
        assert_eq!(frozen.read_u8().unwrap(), 2);
    }

    #[test]
    fn test_invalid_utf8() {
        let mut buf = DataBufMut::new();
        buf.write_byte_array(&[0xFF, 0xFE]);
        let err = buf.freeze().read_string().unwrap_err();
        assert!(matches!(err, BufferError::InvalidUtf8(_)));
    }

    #[test]
    fn test_invalid_char() {
        let mut buf = DataBufMut::new();
        buf.write_u32(0xD800);
        let err = buf.freeze().read_char().unwrap_err();
        assert!(matches!(err, BufferError::InvalidChar(0xD800)));
    }
}
