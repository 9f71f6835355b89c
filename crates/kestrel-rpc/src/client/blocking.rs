//! Synchronous facade over [`RpcClient`] for threads outside the runtime.

use std::any::Any;
use std::time::Duration;

use tokio::runtime::Handle;

use super::sender::callback_channel;
use super::RpcClient;
use crate::error::Result;

/// Blocking wrapper around an [`RpcClient`].
///
/// Calls are submitted to the runtime behind `handle` and the calling thread
/// parks until the response arrives.
///
/// # Panics
///
/// Every method panics when called from a thread that is driving an
/// asynchronous runtime.
#[derive(Clone)]
pub struct BlockingRpcClient {
    client: RpcClient,
    handle: Handle,
}

impl BlockingRpcClient {
    pub fn new(client: RpcClient, handle: Handle) -> Self {
        Self { client, handle }
    }

    pub fn client(&self) -> &RpcClient {
        &self.client
    }

    pub fn start(&self) -> Result<()> {
        self.handle.block_on(self.client.start())
    }

    pub fn stop(&self) {
        self.handle.block_on(self.client.stop())
    }

    pub fn send_request<Req, Resp>(&self, request: Req, timeout: Duration) -> Result<Resp>
    where
        Req: Any + Send + Sync,
        Resp: Any + Clone + Send + Sync,
    {
        let (callback, receiver) = callback_channel();
        let client = self.client.clone();
        self.handle.spawn(async move {
            client.send_request_with_callback(request, timeout, callback);
        });
        receiver.blocking_recv()?.downcast::<Resp>()
    }
}
