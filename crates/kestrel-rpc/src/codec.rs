//! Pluggable payload serialization.
//!
//! The RPC layer only owns the frame envelope. Application payloads go through
//! a [`MessageCodec`]; [`JsonCodec`] is the default.
//!
//! # Example
//!
//! ```rust
//! use kestrel_rpc::codec::{JsonCodec, MessageCodec};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize, Debug, PartialEq)]
//! struct Ping { seq: u32 }
//!
//! let codec = JsonCodec;
//! let bytes = codec.encode(&Ping { seq: 1 }).unwrap();
//! assert_eq!(&bytes, br#"{"seq":1}"#);
//!
//! let decoded: Ping = codec.decode(&bytes).unwrap();
//! assert_eq!(decoded, Ping { seq: 1 });
//! ```

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

/// Error type for codec operations.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Failed to encode a message to bytes.
    #[error("encode error: {0}")]
    Encode(#[source] Box<dyn std::error::Error + Send + Sync>),
    /// Failed to decode bytes to a message.
    #[error("decode error: {0}")]
    Decode(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// Payload serialization format shared by client and server.
///
/// Implementations must be cheap to clone; the protocol registry captures a
/// clone per registered type.
pub trait MessageCodec: Clone + Send + Sync + 'static {
    /// Encode a serializable message to bytes.
    fn encode<T: Serialize>(&self, msg: &T) -> Result<Vec<u8>, CodecError>;

    /// Decode bytes to a deserializable message.
    fn decode<T: DeserializeOwned>(&self, buf: &[u8]) -> Result<T, CodecError>;
}

/// JSON codec using serde_json.
#[derive(Clone, Default, Debug, Copy)]
pub struct JsonCodec;

impl MessageCodec for JsonCodec {
    fn encode<T: Serialize>(&self, msg: &T) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(msg).map_err(|e| CodecError::Encode(Box::new(e)))
    }

    fn decode<T: DeserializeOwned>(&self, buf: &[u8]) -> Result<T, CodecError> {
        serde_json::from_slice(buf).map_err(|e| CodecError::Decode(Box::new(e)))
    }
}
