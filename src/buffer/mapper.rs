//! Object mappers for arbitrary serde types
//!
//! A mapper turns a structured object into bytes and back. The bytes are
//! stored in the buffer as a length-prefixed byte array, so a reader that
//! does not care about an object can still skip it.

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::{BufferError, BufferResult, DataBufMut, DataRead};

/// Pluggable object serialization
pub trait ObjectMapper: Send + Sync {
    /// Encode `value` into raw bytes
    fn to_bytes<T: Serialize + ?Sized>(&self, value: &T) -> BufferResult<Vec<u8>>;

    /// Decode a value from raw bytes
    fn from_bytes<T: DeserializeOwned>(&self, bytes: &[u8]) -> BufferResult<T>;

    fn write_object<T: Serialize + ?Sized>(&self, buf: &mut DataBufMut, value: &T) -> BufferResult<()> {
        let bytes = self.to_bytes(value)?;
        buf.write_byte_array(&bytes);
        Ok(())
    }

    fn read_object<T: DeserializeOwned, R: DataRead>(&self, buf: &mut R) -> BufferResult<T> {
        let bytes = buf.read_bytes()?;
        self.from_bytes(&bytes)
    }
}

/// Compact binary mapping via bincode
#[derive(Debug, Clone, Copy, Default)]
pub struct BincodeMapper;

impl ObjectMapper for BincodeMapper {
    fn to_bytes<T: Serialize + ?Sized>(&self, value: &T) -> BufferResult<Vec<u8>> {
        bincode::serialize(value).map_err(|e| BufferError::Object(e.to_string()))
    }

    fn from_bytes<T: DeserializeOwned>(&self, bytes: &[u8]) -> BufferResult<T> {
        bincode::deserialize(bytes).map_err(|e| BufferError::Object(e.to_string()))
    }
}

/// Human-readable mapping via JSON, handy for debugging payloads
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonMapper;

impl ObjectMapper for JsonMapper {
    fn to_bytes<T: Serialize + ?Sized>(&self, value: &T) -> BufferResult<Vec<u8>> {
        serde_json::to_vec(value).map_err(|e| BufferError::Object(e.to_string()))
    }

    fn from_bytes<T: DeserializeOwned>(&self, bytes: &[u8]) -> BufferResult<T> {
        serde_json::from_slice(bytes).map_err(|e| BufferError::Object(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct ServiceSnapshot {
        name: String,
        port: u16,
        tags: Vec<String>,
    }

    fn snapshot() -> ServiceSnapshot {
        ServiceSnapshot {
            name: "Lobby-1".to_string(),
            port: 25565,
            tags: vec!["lobby".to_string()],
        }
    }

    #[test]
    fn test_bincode_object_roundtrip() {
        let mut buf = DataBufMut::new();
        buf.write_object(&snapshot()).unwrap().write_i32(7);

        let mut buf = buf.freeze();
        let decoded: ServiceSnapshot = buf.read_object().unwrap();
        assert_eq!(decoded, snapshot());
        assert_eq!(buf.read_i32().unwrap(), 7);
    }

    #[test]
    fn test_json_mapper_is_injectable() {
        let mut buf = DataBufMut::new();
        buf.write_object_with(&JsonMapper, &snapshot()).unwrap();

        let mut frozen = buf.freeze();
        let raw = frozen.clone().read_string().unwrap();
        assert!(raw.contains("\"Lobby-1\""));

        let decoded: ServiceSnapshot = frozen.read_object_with(&JsonMapper).unwrap();
        assert_eq!(decoded, snapshot());
    }

    #[test]
    fn test_mapper_error_surfaces() {
        let mut buf = DataBufMut::new();
        buf.write_byte_array(b"not json");
        let result: BufferResult<ServiceSnapshot> = buf.freeze().read_object_with(&JsonMapper);
        assert!(matches!(result, Err(BufferError::Object(_))));
    }
}
