//! RPC client: connection management and request routing.
//!
//! An [`RpcClient`] keeps one connection per endpoint named by its strategy,
//! reconnecting with backoff when a connection drops. Every call is routed
//! through the sender the strategy derives from the current pool snapshot.
//!
//! # Example
//!
//! ```rust,no_run
//! use kestrel_rpc::strategy;
//! use kestrel_rpc::{RpcClient, RpcProtocol};
//! use std::time::Duration;
//!
//! # async fn run() -> kestrel_rpc::Result<()> {
//! let protocol = RpcProtocol::builder().register::<String, String>().build()?;
//! let client = RpcClient::builder(protocol, strategy::server("127.0.0.1:7070".parse().unwrap()))
//!     .build();
//! client.start().await?;
//!
//! let echoed: String = client
//!     .send_request("hello".to_string(), Duration::from_secs(1))
//!     .await?;
//! # let _ = echoed;
//! client.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod blocking;
pub mod connection;
pub mod correlation;
pub mod pool;
pub mod reconnect;
pub mod sender;

pub use blocking::BlockingRpcClient;
pub use connection::RpcClientConnection;
pub use pool::{ConnectionId, ConnectionPool, PoolSnapshot};
pub use reconnect::ReconnectConfig;
pub use sender::{callback_channel, Callback, CallbackReceiver, RpcSender};

use std::any::Any;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::RpcClientConfig;
use crate::error::{Result, RpcError};
use crate::protocol::RpcProtocol;
use crate::strategy::RpcStrategy;
use connection::ConnectionContext;
use reconnect::Backoff;

/// Builder for [`RpcClient`].
pub struct RpcClientBuilder {
    protocol: Arc<RpcProtocol>,
    strategy: Arc<dyn RpcStrategy>,
    config: RpcClientConfig,
}

impl RpcClientBuilder {
    pub fn with_config(mut self, config: RpcClientConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> RpcClient {
        let (shutdown, _) = watch::channel(false);
        RpcClient {
            inner: Arc::new(ClientInner {
                protocol: self.protocol,
                strategy: self.strategy,
                config: self.config,
                pool: Arc::new(ConnectionPool::new()),
                cached_sender: Mutex::new(None),
                shutdown,
                tasks: Mutex::new(Vec::new()),
                started: AtomicBool::new(false),
            }),
        }
    }
}

/// Client handle. Cheap to clone; clones share connections.
///
/// Dropping the last clone closes every connection.
#[derive(Clone)]
pub struct RpcClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    protocol: Arc<RpcProtocol>,
    strategy: Arc<dyn RpcStrategy>,
    config: RpcClientConfig,
    pool: Arc<ConnectionPool>,
    /// Sender derived for the pool version it was derived from.
    cached_sender: Mutex<Option<(u64, Option<Arc<dyn RpcSender>>)>>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl ClientInner {
    fn context(&self) -> ConnectionContext {
        ConnectionContext::new(
            self.protocol.clone(),
            self.pool.clone(),
            &self.config,
            self.shutdown.subscribe(),
        )
    }

    fn track(&self, task: JoinHandle<()>) {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(task);
    }
}

impl RpcClient {
    pub fn builder(
        protocol: impl Into<Arc<RpcProtocol>>,
        strategy: impl RpcStrategy + 'static,
    ) -> RpcClientBuilder {
        RpcClientBuilder {
            protocol: protocol.into(),
            strategy: Arc::new(strategy),
            config: RpcClientConfig::default(),
        }
    }

    pub fn protocol(&self) -> &Arc<RpcProtocol> {
        &self.inner.protocol
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.inner.pool
    }

    pub fn config(&self) -> &RpcClientConfig {
        &self.inner.config
    }

    /// Connect to every strategy address and keep those connections alive.
    ///
    /// Fails with [`RpcError::NoSenderAvailable`] if the strategy has no
    /// route after the initial connection round, unless forced start is
    /// configured. A failed start leaves the client stopped.
    pub async fn start(&self) -> Result<()> {
        if self.inner.started.swap(true, Ordering::AcqRel) {
            return Err(RpcError::config("client already started"));
        }
        if *self.inner.shutdown.borrow() {
            return Err(RpcError::config("client already stopped"));
        }

        let addresses: Vec<SocketAddr> = self.inner.strategy.addresses().into_iter().collect();
        info!("Starting RPC client for {} endpoint(s)", addresses.len());

        let connect_timeout = self.inner.config.connect_timeout;
        let attempts = addresses
            .iter()
            .map(|&endpoint| connection::connect(endpoint, connect_timeout, self.inner.context()));
        let results = join_all(attempts).await;

        for (endpoint, result) in addresses.into_iter().zip(results) {
            let driver = match result {
                Ok((_, driver)) => Some(driver),
                Err(err) => {
                    warn!("Initial connect failed: {}", err);
                    None
                }
            };
            let reconnector = Reconnector {
                endpoint,
                connect_timeout,
                backoff_config: self.inner.config.reconnect.clone(),
                context: self.inner.context(),
            };
            self.inner.track(tokio::spawn(reconnector.run(driver)));
        }

        if self.sender().is_none() && !self.inner.config.forced_start {
            warn!("No route available after connecting; stopping client");
            self.stop().await;
            return Err(RpcError::NoSenderAvailable);
        }
        Ok(())
    }

    /// Open one connection to `endpoint` unless it is already connected.
    ///
    /// Connections opened here are not reconnected when they drop.
    pub async fn connect(&self, endpoint: SocketAddr) -> Result<()> {
        if *self.inner.shutdown.borrow() {
            return Err(RpcError::config("client already stopped"));
        }
        if self.inner.pool.get(&endpoint).is_some() {
            return Ok(());
        }
        let (_, driver) = connection::connect(
            endpoint,
            self.inner.config.connect_timeout,
            self.inner.context(),
        )
        .await?;
        self.inner.track(driver);
        Ok(())
    }

    /// Sender derived from the current pool snapshot, if any route exists.
    ///
    /// Re-derived only when the pool version changes.
    pub fn sender(&self) -> Option<Arc<dyn RpcSender>> {
        let snapshot = self.inner.pool.snapshot();
        let mut cached = self
            .inner
            .cached_sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some((version, sender)) = cached.as_ref() {
            if *version == snapshot.version() {
                return sender.clone();
            }
        }

        let sender = self.inner.strategy.create_sender(&snapshot);
        debug!(
            version = snapshot.version(),
            available = sender.is_some(),
            "Derived sender for {} connection(s)",
            snapshot.len()
        );
        *cached = Some((snapshot.version(), sender.clone()));
        sender
    }

    /// Send `request` and deliver the outcome to `callback`.
    ///
    /// Every failure, including an unregistered request type or a missing
    /// route, arrives through the callback.
    pub fn send_request_with_callback<Req>(&self, request: Req, timeout: Duration, callback: Callback)
    where
        Req: Any + Send + Sync,
    {
        let request = match self.inner.protocol.request(request) {
            Ok(request) => request,
            Err(err) => return callback(Err(err)),
        };
        match self.sender() {
            Some(sender) => sender.send_request(request, timeout, callback),
            None => callback(Err(RpcError::NoSenderAvailable)),
        }
    }

    /// Send `request` and wait for its typed response.
    pub async fn send_request<Req, Resp>(&self, request: Req, timeout: Duration) -> Result<Resp>
    where
        Req: Any + Send + Sync,
        Resp: Any + Clone + Send + Sync,
    {
        let (callback, receiver) = callback_channel();
        self.send_request_with_callback(request, timeout, callback);
        receiver.recv().await?.downcast::<Resp>()
    }

    /// Stop reconnecting, close every connection and wait for them to finish.
    ///
    /// Requests still in flight fail with `ConnectionClosed`.
    pub async fn stop(&self) {
        if self.inner.shutdown.send_replace(true) {
            return;
        }
        info!("Stopping RPC client");

        let tasks = std::mem::take(
            &mut *self
                .inner
                .tasks
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for result in join_all(tasks).await {
            if let Err(err) = result {
                warn!("Client task ended abnormally: {}", err);
            }
        }
        self.inner.pool.clear();
    }
}

/// Keeps one endpoint connected until the client shuts down.
struct Reconnector {
    endpoint: SocketAddr,
    connect_timeout: Duration,
    backoff_config: ReconnectConfig,
    context: ConnectionContext,
}

impl Reconnector {
    async fn run(self, mut driver: Option<JoinHandle<()>>) {
        let mut shutdown = self.context.shutdown.clone();
        let mut backoff = Backoff::default();

        loop {
            if let Some(running) = driver.take() {
                backoff.reset();
                let _ = running.await;
            }
            if *shutdown.borrow_and_update() {
                return;
            }

            let delay = backoff.next_delay(&self.backoff_config);
            debug!("Reconnecting to {} in {:?}", self.endpoint, delay);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => return,
            }

            match connection::connect(self.endpoint, self.connect_timeout, self.context.clone()).await {
                Ok((_, running)) => driver = Some(running),
                Err(err) => warn!(
                    attempt = backoff.attempts(),
                    "Reconnect to {} failed: {}", self.endpoint, err
                ),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::{round_robin, server, servers};

    fn protocol() -> RpcProtocol {
        RpcProtocol::builder().register::<String, String>().build().unwrap()
    }

    fn unused_addr() -> SocketAddr {
        // Port 1 is privileged and normally closed.
        "127.0.0.1:1".parse().unwrap()
    }

    #[tokio::test]
    async fn test_start_without_route_fails() {
        let client = RpcClient::builder(protocol(), server(unused_addr())).build();
        let result = client.start().await;
        assert!(matches!(result, Err(RpcError::NoSenderAvailable)));
        assert!(client.pool().is_empty());
    }

    #[tokio::test]
    async fn test_forced_start_succeeds_without_route() {
        let client = RpcClient::builder(protocol(), round_robin(servers([unused_addr()])))
            .with_config(RpcClientConfig::default().with_forced_start(true))
            .build();
        client.start().await.unwrap();
        assert!(client.sender().is_none());

        let result: Result<String> = client
            .send_request("x".to_string(), Duration::from_secs(1))
            .await;
        assert!(matches!(result, Err(RpcError::NoSenderAvailable)));
        client.stop().await;
    }

    #[tokio::test]
    async fn test_start_twice_rejected() {
        let client = RpcClient::builder(protocol(), server(unused_addr()))
            .with_config(RpcClientConfig::default().with_forced_start(true))
            .build();
        client.start().await.unwrap();
        assert!(matches!(client.start().await, Err(RpcError::Config { .. })));
        client.stop().await;
    }

    #[tokio::test]
    async fn test_unregistered_request_reported_through_callback() {
        let client = RpcClient::builder(protocol(), server(unused_addr())).build();
        let result: Result<String> = client.send_request(5u32, Duration::from_secs(1)).await;
        assert!(matches!(result, Err(RpcError::UnregisteredType { .. })));
    }
}
