//! Message registry shared by client and server.
//!
//! Request/response pairs are registered in order at startup; the order
//! fixes the type tags (see [`TypeTag`]). Client and server must register the
//! same pairs in the same order. A mismatch cannot be detected on the wire;
//! compare [`RpcProtocol::fingerprint`] values when in doubt.
//!
//! ```rust
//! use kestrel_rpc::protocol::{RpcProtocol, TypeTag};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Clone, Serialize, Deserialize)]
//! struct Get { key: String }
//!
//! #[derive(Clone, Serialize, Deserialize)]
//! struct Value { value: Option<String> }
//!
//! let protocol = RpcProtocol::builder().register::<Get, Value>().build().unwrap();
//! assert_eq!(protocol.request_tag::<Get>(), Some(TypeTag::request(0)));
//! ```

pub mod envelope;
pub mod frame;
pub mod message;
pub(crate) mod outbound;

pub use envelope::{ControlMessage, RemoteExceptionEnvelope};
pub use frame::{Frame, FrameCodec, TypeTag};
pub use message::{Request, Response};

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::codec::{CodecError, JsonCodec, MessageCodec};
use crate::error::{Result, RpcError};
use message::AnyValue;

type EncodeFn = Arc<dyn Fn(&(dyn Any + Send + Sync)) -> std::result::Result<Vec<u8>, CodecError> + Send + Sync>;
type DecodeFn = Arc<dyn Fn(&[u8]) -> std::result::Result<AnyValue, CodecError> + Send + Sync>;
type AbsentFn = Arc<dyn Fn(&(dyn Any + Send + Sync)) -> bool + Send + Sync>;

/// One registered message type.
#[derive(Clone)]
struct MessageType {
    type_id: TypeId,
    type_name: &'static str,
    encode: EncodeFn,
    decode: DecodeFn,
    /// Set only for responses registered with
    /// [`RpcProtocolBuilder::register_optional`].
    absent: Option<AbsentFn>,
}

impl MessageType {
    fn of<T, C>(codec: &C) -> Self
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
        C: MessageCodec,
    {
        let encoder = codec.clone();
        let decoder = codec.clone();
        Self {
            type_id: TypeId::of::<T>(),
            type_name: std::any::type_name::<T>(),
            encode: Arc::new(move |value: &(dyn Any + Send + Sync)| {
                let value = value
                    .downcast_ref::<T>()
                    .ok_or_else(|| CodecError::Encode("value does not match registered type".into()))?;
                encoder.encode(value)
            }),
            decode: Arc::new(move |buf: &[u8]| {
                decoder
                    .decode::<T>(buf)
                    .map(|value| Arc::new(value) as AnyValue)
            }),
            absent: None,
        }
    }

    /// `Option<T>` whose `None` marks the response as absent.
    fn optional<T, C>(codec: &C) -> Self
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
        C: MessageCodec,
    {
        let absent: AbsentFn = Arc::new(|value: &(dyn Any + Send + Sync)| {
            value
                .downcast_ref::<Option<T>>()
                .is_some_and(Option::is_none)
        });
        Self {
            absent: Some(absent),
            ..Self::of::<Option<T>, C>(codec)
        }
    }

    fn is_absent(&self, value: &AnyValue) -> bool {
        self.absent.as_ref().is_some_and(|absent| absent(&**value))
    }
}

/// Immutable registration table.
#[derive(Clone)]
pub struct RpcProtocol {
    /// Indexed by `tag - 2`: request, response, request, response, ...
    types: Vec<MessageType>,
    request_tags: HashMap<TypeId, TypeTag>,
    fingerprint: String,
}

impl RpcProtocol {
    /// Start a registration table using [`JsonCodec`] for payloads.
    pub fn builder() -> RpcProtocolBuilder<JsonCodec> {
        Self::builder_with_codec(JsonCodec)
    }

    pub fn builder_with_codec<C: MessageCodec>(codec: C) -> RpcProtocolBuilder<C> {
        RpcProtocolBuilder {
            codec,
            pairs: Vec::new(),
        }
    }

    /// Number of registered request/response pairs.
    pub fn len(&self) -> usize {
        self.types.len() / 2
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    /// Short digest of the ordered registration list.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Tag assigned to request type `T`.
    pub fn request_tag<T: Any>(&self) -> Option<TypeTag> {
        self.request_tag_by_id(TypeId::of::<T>())
    }

    pub(crate) fn request_tag_by_id(&self, type_id: TypeId) -> Option<TypeTag> {
        self.request_tags.get(&type_id).copied()
    }

    /// Name of the Rust type registered under `tag`.
    pub fn type_name(&self, tag: TypeTag) -> Option<&'static str> {
        self.entry(tag).map(|entry| entry.type_name)
    }

    pub(crate) fn type_id_of(&self, tag: TypeTag) -> Option<TypeId> {
        self.entry(tag).map(|entry| entry.type_id)
    }

    fn entry(&self, tag: TypeTag) -> Option<&MessageType> {
        let index = tag.0.checked_sub(TypeTag::request(0).0)?;
        self.types.get(index as usize)
    }

    /// Encode `value` as a request.
    pub fn request<T: Any + Send + Sync>(&self, value: T) -> Result<Request> {
        let tag = self
            .request_tag::<T>()
            .ok_or_else(|| RpcError::UnregisteredType {
                type_name: std::any::type_name::<T>().to_string(),
            })?;
        let value: AnyValue = Arc::new(value);
        let payload = self.encode_value(tag, &*value)?;
        Ok(Request {
            tag,
            response_tag: TypeTag::response(tag.pair_index().unwrap_or_default()),
            type_id: TypeId::of::<T>(),
            type_name: std::any::type_name::<T>(),
            value,
            payload,
        })
    }

    /// Encode any registered value under `tag`.
    pub fn encode_value(&self, tag: TypeTag, value: &(dyn Any + Send + Sync)) -> Result<Bytes> {
        let entry = self.entry(tag).ok_or_else(|| unknown_tag(tag))?;
        (entry.encode)(value)
            .map(Bytes::from)
            .map_err(|err| RpcError::serialization(entry.type_name, err))
    }

    pub(crate) fn decode_value(&self, tag: TypeTag, payload: &[u8]) -> Result<AnyValue> {
        let entry = self.entry(tag).ok_or_else(|| unknown_tag(tag))?;
        (entry.decode)(payload).map_err(|err| RpcError::serialization(entry.type_name, err))
    }

    /// Decode a response payload received under `tag`.
    pub fn decode_response(&self, tag: TypeTag, payload: &[u8]) -> Result<Response> {
        if !tag.is_response() {
            return Err(RpcError::protocol(format!("{} is not a response tag", tag)));
        }
        let entry = self.entry(tag).ok_or_else(|| unknown_tag(tag))?;
        let value =
            (entry.decode)(payload).map_err(|err| RpcError::serialization(entry.type_name, err))?;
        let absent = entry.is_absent(&value);
        Ok(Response::from_decoded(value, entry.type_name, absent))
    }
}

fn unknown_tag(tag: TypeTag) -> RpcError {
    RpcError::protocol(format!("unknown type tag {}", tag))
}

impl fmt::Debug for RpcProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<_> = self.types.iter().map(|entry| entry.type_name).collect();
        f.debug_struct("RpcProtocol")
            .field("types", &names)
            .field("fingerprint", &self.fingerprint)
            .finish()
    }
}

/// Builder for [`RpcProtocol`].
pub struct RpcProtocolBuilder<C: MessageCodec = JsonCodec> {
    codec: C,
    pairs: Vec<(MessageType, MessageType)>,
}

impl<C: MessageCodec> RpcProtocolBuilder<C> {
    /// Register a request type and the response type its handler returns.
    pub fn register<Req, Resp>(mut self) -> Self
    where
        Req: Serialize + DeserializeOwned + Send + Sync + 'static,
        Resp: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        self.pairs
            .push((MessageType::of::<Req, C>(&self.codec), MessageType::of::<Resp, C>(&self.codec)));
        self
    }

    /// Register a request whose response is `Option<T>`, with `None`
    /// reported as an absent result.
    ///
    /// Handlers and callers use `Option<T>` as the response type. Responses
    /// of pairs added with [`register`](Self::register) are never absent,
    /// whatever they encode to.
    pub fn register_optional<Req, T>(mut self) -> Self
    where
        Req: Serialize + DeserializeOwned + Send + Sync + 'static,
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        self.pairs.push((
            MessageType::of::<Req, C>(&self.codec),
            MessageType::optional::<T, C>(&self.codec),
        ));
        self
    }

    /// Validate the registrations and freeze the table.
    pub fn build(self) -> Result<RpcProtocol> {
        if self.pairs.len() > (u32::MAX as usize - 3) / 2 {
            return Err(RpcError::config("too many registered message types"));
        }

        let mut request_tags = HashMap::new();
        let mut types = Vec::with_capacity(self.pairs.len() * 2);
        let mut hasher = blake3::Hasher::new();

        for (index, (request, response)) in self.pairs.into_iter().enumerate() {
            let tag = TypeTag::request(index as u32);
            if request_tags.insert(request.type_id, tag).is_some() {
                return Err(RpcError::config(format!(
                    "request type {} registered more than once",
                    request.type_name
                )));
            }
            hasher.update(request.type_name.as_bytes());
            hasher.update(b"->");
            hasher.update(response.type_name.as_bytes());
            hasher.update(b";");
            types.push(request);
            types.push(response);
        }

        let mut fingerprint = hasher.finalize().to_hex().to_string();
        fingerprint.truncate(16);

        Ok(RpcProtocol {
            types,
            request_tags,
            fingerprint,
        })
    }
}
