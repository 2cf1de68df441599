//! Payload codec.
//!
//! The engine only handles structured values; the byte representation is
//! delegated to a [`Codec`].

use serde_json::Value;

use crate::error::{Error, Result};

/// Converts between raw transport bytes and structured payloads.
pub trait Codec: Send + Sync {
    fn decode(&self, bytes: &[u8]) -> Result<Value>;

    fn encode(&self, value: &Value) -> Result<Vec<u8>>;
}

/// JSON codec. Empty payloads decode to `null`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn decode(&self, bytes: &[u8]) -> Result<Value> {
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(Value::Null);
        }
        serde_json::from_slice(bytes).map_err(|e| Error::Codec(e.to_string()))
    }

    fn encode(&self, value: &Value) -> Result<Vec<u8>> {
        serde_json::to_vec(value).map_err(|e| Error::Codec(e.to_string()))
    }
}
