//! Read-only buffer view

use bytes::Bytes;

use super::{BufferError, BufferResult, DataRead};

/// Immutable buffer with its own read cursor.
///
/// Cloning is cheap and yields an independent cursor over the same bytes.
#[derive(Debug, Clone, Default)]
pub struct DataBuf {
    bytes: Bytes,
    read_pos: usize,
    marks: Vec<usize>,
}

impl DataBuf {
    /// An empty buffer
    pub fn empty() -> Self {
        Self::default()
    }

    /// Total number of bytes held, read or not
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Current read position
    pub fn reader_index(&self) -> usize {
        self.read_pos
    }

    /// The unread bytes as a cheap owned slice
    pub fn remaining_bytes(&self) -> Bytes {
        self.bytes.slice(self.read_pos..)
    }

    /// Copy of this buffer with the read cursor moved back to the start
    pub fn rewound(&self) -> Self {
        Self::from(self.bytes.clone())
    }
}

impl From<Bytes> for DataBuf {
    fn from(bytes: Bytes) -> Self {
        Self {
            bytes,
            read_pos: 0,
            marks: Vec::new(),
        }
    }
}

impl From<Vec<u8>> for DataBuf {
    fn from(bytes: Vec<u8>) -> Self {
        Self::from(Bytes::from(bytes))
    }
}

impl PartialEq for DataBuf {
    /// Two buffers are equal when their unread contents are equal
    fn eq(&self, other: &Self) -> bool {
        self.chunk() == other.chunk()
    }
}

impl Eq for DataBuf {}

impl DataRead for DataBuf {
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
        let out = self.bytes.slice(self.read_pos..self.read_pos + len);
        self.read_pos += len;
        Ok(out)
    }

    fn start_transaction(&mut self) {
        self.marks.push(self.read_pos);
    }

    fn redo_transaction(&mut self) {
        if let Some(pos) = self.marks.pop() {
            self.read_pos = pos;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_raw_is_zero_copy_slice() {
        let mut buf = DataBuf::from(vec![1, 2, 3, 4]);
        let head = buf.read_raw(2).unwrap();
        assert_eq!(&head[..], &[1, 2]);
        assert_eq!(buf.readable_bytes(), 2);
        assert_eq!(buf.reader_index(), 2);
    }

    #[test]
    fn test_underflow() {
        let mut buf = DataBuf::from(vec![0, 0, 1]);
        let err = buf.read_i32().unwrap_err();
        assert!(matches!(err, BufferError::Underflow { needed: 4, remaining: 3 }));
        // A failed read leaves the cursor untouched
        assert_eq!(buf.readable_bytes(), 3);
    }

    #[test]
    fn test_nested_transactions() {
        let mut buf = DataBuf::from(vec![1, 2, 3, 4]);
        buf.start_transaction();
        buf.read_u8().unwrap();
        buf.start_transaction();
        buf.read_u8().unwrap();
        buf.redo_transaction();
        assert_eq!(buf.reader_index(), 1);
        buf.redo_transaction();
        assert_eq!(buf.reader_index(), 0);
        // No open transaction: nothing happens
        buf.redo_transaction();
        assert_eq!(buf.reader_index(), 0);
    }

    #[test]
    fn test_clone_has_independent_cursor() {
        let mut buf = DataBuf::from(vec![7, 8]);
        let copy = buf.clone();
        buf.read_u8().unwrap();
        assert_eq!(copy.readable_bytes(), 2);
        assert_eq!(buf.rewound().readable_bytes(), 2);
    }
}
