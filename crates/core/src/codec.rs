//! Payload serialization (the packer between dispatchers and drivers).
//!
//! Payloads travel the queue as opaque bytes; the codec is the only layer
//! that knows the wire format. The default is JSON, matching everything
//! else this toolkit persists.

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("marshal failed: {0}")]
    Marshal(String),

    #[error("unmarshal failed: {0}")]
    Unmarshal(String),
}

/// Bidirectional payload codec.
///
/// Implementations must be deterministic: `unmarshal(marshal(x))` produces
/// a value structurally equal to `x` for every payload the application may
/// enqueue.
pub trait Codec: Send + Sync {
    fn marshal(&self, value: &JsonValue) -> Result<Vec<u8>, CodecError>;

    fn unmarshal(&self, bytes: &[u8]) -> Result<JsonValue, CodecError>;
}

/// JSON wire format (the default).
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn marshal(&self, value: &JsonValue) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(value).map_err(|e| CodecError::Marshal(e.to_string()))
    }

    fn unmarshal(&self, bytes: &[u8]) -> Result<JsonValue, CodecError> {
        serde_json::from_slice(bytes).map_err(|e| CodecError::Unmarshal(e.to_string()))
    }
}

/// Marshal any serializable value through a codec.
pub fn encode<T: Serialize>(codec: &dyn Codec, value: &T) -> Result<Vec<u8>, CodecError> {
    let json = serde_json::to_value(value).map_err(|e| CodecError::Marshal(e.to_string()))?;
    codec.marshal(&json)
}

/// Unmarshal codec bytes into a typed slot.
pub fn decode<T: DeserializeOwned>(codec: &dyn Codec, bytes: &[u8]) -> Result<T, CodecError> {
    let json = codec.unmarshal(bytes)?;
    serde_json::from_value(json).map_err(|e| CodecError::Unmarshal(e.to_string()))
}
