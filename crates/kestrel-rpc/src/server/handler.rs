//! Request handlers.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;

use crate::protocol::message::AnyValue;
use crate::protocol::RemoteExceptionEnvelope;

/// Failure returned by a handler, reported to the caller as a remote exception.
///
/// Any `std::error::Error` converts into it with its Rust type name as the
/// class name, so handlers can use `?` on their own errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerError {
    pub class_name: String,
    pub message: String,
}

impl HandlerError {
    pub fn new(class_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            class_name: class_name.into(),
            message: message.into(),
        }
    }
}

impl<E> From<E> for HandlerError
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn from(err: E) -> Self {
        Self::new(std::any::type_name::<E>(), err.to_string())
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.class_name, self.message)
    }
}

impl From<HandlerError> for RemoteExceptionEnvelope {
    fn from(err: HandlerError) -> Self {
        RemoteExceptionEnvelope::new(err.class_name, err.message)
    }
}

/// Serves one registered request type.
#[async_trait]
pub trait RpcRequestHandler<Req, Resp>: Send + Sync + 'static {
    async fn handle(&self, request: Req) -> Result<Resp, HandlerError>;
}

/// Handler backed by an async closure; see [`handler_fn`].
pub struct HandlerFn<F, Req> {
    f: F,
    _request: PhantomData<fn(Req)>,
}

/// Wrap an async closure as a handler.
///
/// The request type is taken from the closure's argument.
///
/// ```rust
/// use kestrel_rpc::server::{handler_fn, RpcRequestHandler};
///
/// # futures::executor::block_on(async {
/// let echo = handler_fn(|text: String| async move { Ok(text) });
/// assert_eq!(echo.handle("hi".to_string()).await.unwrap(), "hi");
/// # });
/// ```
pub fn handler_fn<F, Fut, Req, Resp>(f: F) -> HandlerFn<F, Req>
where
    F: Fn(Req) -> Fut,
    Fut: Future<Output = Result<Resp, HandlerError>>,
{
    HandlerFn {
        f,
        _request: PhantomData,
    }
}

#[async_trait]
impl<F, Fut, Req, Resp> RpcRequestHandler<Req, Resp> for HandlerFn<F, Req>
where
    F: Fn(Req) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Resp, HandlerError>> + Send + 'static,
    Req: Send + 'static,
    Resp: Send + 'static,
{
    async fn handle(&self, request: Req) -> Result<Resp, HandlerError> {
        (self.f)(request).await
    }
}

/// Type-erased handler stored in the dispatch table.
pub(crate) type ErasedHandler =
    Arc<dyn Fn(AnyValue) -> BoxFuture<'static, Result<AnyValue, HandlerError>> + Send + Sync>;

pub(crate) fn erase<Req, Resp, H>(handler: H) -> ErasedHandler
where
    Req: Any + Send + Sync,
    Resp: Any + Send + Sync,
    H: RpcRequestHandler<Req, Resp>,
{
    let handler = Arc::new(handler);
    Arc::new(move |value: AnyValue| {
        let handler = handler.clone();
        async move {
            let request = value
                .downcast::<Req>()
                .ok()
                .and_then(|request| Arc::try_unwrap(request).ok())
                .ok_or_else(|| {
                    HandlerError::new(
                        "kestrel_rpc::InternalError",
                        format!("request is not a {}", std::any::type_name::<Req>()),
                    )
                })?;
            let response = RpcRequestHandler::<Req, Resp>::handle(&*handler, request).await?;
            Ok::<AnyValue, HandlerError>(Arc::new(response))
        }
        .boxed()
    })
}

/// Run a handler future, turning a panic into a handler error.
pub(crate) async fn run_guarded(
    future: BoxFuture<'static, Result<AnyValue, HandlerError>>,
) -> Result<AnyValue, HandlerError> {
    match AssertUnwindSafe(future).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "handler panicked".to_string());
            Err(HandlerError::new("panic", message))
        }
    }
}
