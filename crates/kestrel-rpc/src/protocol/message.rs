//! Type-erased request and response values.
//!
//! Strategies and connections never see concrete message types. A
//! [`Request`] keeps the typed value next to its encoded payload so routing
//! functions can still look inside it; a [`Response`] carries the decoded
//! value until the caller takes it back out with [`Response::downcast`].

use std::any::{Any, TypeId};
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

use super::frame::TypeTag;
use crate::error::{Result, RpcError};

pub(crate) type AnyValue = Arc<dyn Any + Send + Sync>;

/// An encoded outgoing request.
#[derive(Clone)]
pub struct Request {
    pub(crate) tag: TypeTag,
    pub(crate) response_tag: TypeTag,
    pub(crate) type_id: TypeId,
    pub(crate) type_name: &'static str,
    pub(crate) value: AnyValue,
    pub(crate) payload: Bytes,
}

impl Request {
    pub fn tag(&self) -> TypeTag {
        self.tag
    }

    /// Tag the matching response must carry.
    pub fn response_tag(&self) -> TypeTag {
        self.response_tag
    }

    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Borrow the original typed value, if it is a `T`.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.value.downcast_ref::<T>()
    }

    pub fn is<T: Any>(&self) -> bool {
        self.type_id == TypeId::of::<T>()
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("tag", &self.tag)
            .field("type", &self.type_name)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

/// A decoded response.
#[derive(Clone)]
pub struct Response {
    value: AnyValue,
    type_name: &'static str,
    absent: bool,
}

impl Response {
    /// Wrap a value that is present.
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self {
            value: Arc::new(value),
            type_name: std::any::type_name::<T>(),
            absent: false,
        }
    }

    /// Wrap an optional value; `None` is marked absent.
    ///
    /// The stored value is the `Option<T>` itself, so callers downcast to
    /// `Option<T>`.
    pub fn from_option<T: Any + Send + Sync>(value: Option<T>) -> Self {
        let absent = value.is_none();
        Self {
            value: Arc::new(value),
            type_name: std::any::type_name::<Option<T>>(),
            absent,
        }
    }

    pub(crate) fn from_decoded(value: AnyValue, type_name: &'static str, absent: bool) -> Self {
        Self {
            value,
            type_name,
            absent,
        }
    }

    /// True for a `None` from a pair registered with
    /// [`register_optional`](crate::protocol::RpcProtocolBuilder::register_optional)
    /// or built with [`Response::from_option`].
    pub fn is_absent(&self) -> bool {
        self.absent
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.value.downcast_ref::<T>()
    }

    /// Take the typed value out.
    pub fn downcast<T: Any + Clone + Send + Sync>(self) -> Result<T> {
        let type_name = self.type_name;
        self.value
            .downcast::<T>()
            .map(Arc::unwrap_or_clone)
            .map_err(|_| {
                RpcError::protocol(format!(
                    "response is {} but {} was expected",
                    type_name,
                    std::any::type_name::<T>()
                ))
            })
    }
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("type", &self.type_name)
            .field("absent", &self.absent)
            .finish()
    }
}
