//! The dispatch seam between strategies and connections.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;

use crate::error::{Result, RpcError};
use crate::protocol::{Request, Response};

/// Completion handler for one request. Invoked exactly once.
pub type Callback = Box<dyn FnOnce(Result<Response>) + Send + 'static>;

/// Something that can dispatch a single logical call.
///
/// Connections implement this directly; strategy combinators produce senders
/// that fan out to or pick among other senders. Failures are reported through
/// the callback, never by panicking or returning early.
pub trait RpcSender: Send + Sync {
    fn send_request(&self, request: Request, timeout: Duration, callback: Callback);
}

impl<S: RpcSender + ?Sized> RpcSender for Arc<S> {
    fn send_request(&self, request: Request, timeout: Duration, callback: Callback) {
        (**self).send_request(request, timeout, callback)
    }
}

/// Bridge a callback to a future.
///
/// The receiver resolves to `ConnectionClosed` if the callback is dropped
/// without being called.
pub fn callback_channel() -> (Callback, CallbackReceiver) {
    let (tx, rx) = oneshot::channel();
    let callback: Callback = Box::new(move |result| {
        let _ = tx.send(result);
    });
    (callback, CallbackReceiver { rx })
}

/// Future side of [`callback_channel`].
pub struct CallbackReceiver {
    rx: oneshot::Receiver<Result<Response>>,
}

impl CallbackReceiver {
    pub async fn recv(self) -> Result<Response> {
        self.rx.await.unwrap_or(Err(RpcError::ConnectionClosed))
    }

    /// Blocking variant for threads outside the runtime.
    ///
    /// # Panics
    ///
    /// Panics when called from within an asynchronous execution context.
    pub fn blocking_recv(self) -> Result<Response> {
        self.rx.blocking_recv().unwrap_or(Err(RpcError::ConnectionClosed))
    }
}
