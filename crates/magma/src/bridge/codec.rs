//! JSON body codec for broker envelopes.
//!
//! The broker delivers whole message bodies, so no length framing is needed:
//! one envelope per message, serialized with serde_json.

use std::marker::PhantomData;

use bytes::Bytes;
use serde::{Serialize, de::DeserializeOwned};

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("failed to encode envelope: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("failed to decode envelope: {0}")]
    Decode(#[source] serde_json::Error),
}

/// Bodies above this size are logged at info level when encoded.
const LARGE_BODY_BYTES: usize = 100_000;

/// Codec that serializes one envelope type to and from a message body.
pub struct JsonCodec<T> {
    _phantom: PhantomData<fn() -> T>,
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for JsonCodec<T> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<T> JsonCodec<T> {
    pub fn new() -> Self {
        Self {
            _phantom: PhantomData,
        }
    }
}

impl<T: Serialize> JsonCodec<T> {
    pub fn encode(&self, item: &T) -> Result<Bytes, CodecError> {
        let json = serde_json::to_vec(item).map_err(CodecError::Encode)?;
        let json_len = json.len();
        tracing::trace!(json_size_bytes = json_len, "Encoding envelope");
        if json_len > LARGE_BODY_BYTES {
            tracing::info!(
                json_size_bytes = json_len,
                json_size_kb = json_len / 1024,
                "Large envelope being encoded"
            );
        }
        Ok(Bytes::from(json))
    }
}

impl<T: DeserializeOwned> JsonCodec<T> {
    pub fn decode(&self, body: &[u8]) -> Result<T, CodecError> {
        serde_json::from_slice(body).map_err(CodecError::Decode)
    }
}
