//! RPC server: accepts connections and dispatches requests to handlers.
//!
//! The handler table is fixed when the server is built: one handler per
//! registered request type, checked against the protocol's registrations up
//! front so a mismatch fails at startup instead of at dispatch time.
//!
//! # Example
//!
//! ```rust,no_run
//! use kestrel_rpc::server::{handler_fn, HandlerError, RpcServer};
//! use kestrel_rpc::RpcProtocol;
//!
//! # async fn run() -> kestrel_rpc::Result<()> {
//! let protocol = RpcProtocol::builder().register::<String, String>().build()?;
//! let server = RpcServer::builder(protocol)
//!     .with_handler::<String, String, _>(handler_fn(|text: String| async move {
//!         Ok::<_, HandlerError>(text)
//!     }))
//!     .build()?;
//!
//! let handle = server.listen("127.0.0.1:0".parse().unwrap()).await?;
//! println!("listening on {}", handle.addr());
//! handle.close().await;
//! # Ok(())
//! # }
//! ```

mod connection;
mod handler;

pub use handler::{handler_fn, HandlerError, HandlerFn, RpcRequestHandler};

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::{oneshot, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::config::RpcServerConfig;
use crate::error::{Result, RpcError};
use crate::protocol::{RpcProtocol, TypeTag};
use handler::{erase, ErasedHandler};

pub(crate) struct Route {
    response_tag: TypeTag,
    handler: ErasedHandler,
}

/// Handler table shared by every connection of one server.
pub(crate) struct Dispatcher {
    protocol: Arc<RpcProtocol>,
    routes: HashMap<TypeTag, Route>,
}

struct PendingHandler {
    request_type: TypeId,
    request_name: &'static str,
    response_type: TypeId,
    response_name: &'static str,
    handler: ErasedHandler,
}

/// Builder for [`RpcServer`].
pub struct RpcServerBuilder {
    protocol: Arc<RpcProtocol>,
    handlers: Vec<PendingHandler>,
    config: RpcServerConfig,
}

impl RpcServerBuilder {
    /// Serve requests of type `Req` with `handler`.
    pub fn with_handler<Req, Resp, H>(mut self, handler: H) -> Self
    where
        Req: Any + Send + Sync,
        Resp: Any + Send + Sync,
        H: RpcRequestHandler<Req, Resp>,
    {
        self.handlers.push(PendingHandler {
            request_type: TypeId::of::<Req>(),
            request_name: std::any::type_name::<Req>(),
            response_type: TypeId::of::<Resp>(),
            response_name: std::any::type_name::<Resp>(),
            handler: erase::<Req, Resp, H>(handler),
        });
        self
    }

    pub fn with_config(mut self, config: RpcServerConfig) -> Self {
        self.config = config;
        self
    }

    /// Validate handlers against the protocol.
    ///
    /// Fails if a handler's request type is not registered, its response type
    /// differs from the registered one, or two handlers serve the same type.
    pub fn build(self) -> Result<RpcServer> {
        let mut routes = HashMap::with_capacity(self.handlers.len());

        for pending in self.handlers {
            let Some(tag) = self.protocol.request_tag_by_id(pending.request_type) else {
                return Err(RpcError::config(format!(
                    "handler for unregistered request type {}",
                    pending.request_name
                )));
            };
            let response_tag = tag.response_tag().ok_or_else(|| {
                RpcError::config(format!("{} has no response tag", tag))
            })?;
            if self.protocol.type_id_of(response_tag) != Some(pending.response_type) {
                return Err(RpcError::config(format!(
                    "handler for {} returns {} but {} is registered",
                    pending.request_name,
                    pending.response_name,
                    self.protocol.type_name(response_tag).unwrap_or("nothing")
                )));
            }

            let route = Route {
                response_tag,
                handler: pending.handler,
            };
            if routes.insert(tag, route).is_some() {
                return Err(RpcError::config(format!(
                    "more than one handler for {}",
                    pending.request_name
                )));
            }
        }

        Ok(RpcServer {
            dispatcher: Arc::new(Dispatcher {
                protocol: self.protocol,
                routes,
            }),
            config: self.config,
        })
    }
}

/// A validated handler table, ready to listen.
#[derive(Clone)]
pub struct RpcServer {
    dispatcher: Arc<Dispatcher>,
    config: RpcServerConfig,
}

impl RpcServer {
    pub fn builder(protocol: impl Into<Arc<RpcProtocol>>) -> RpcServerBuilder {
        RpcServerBuilder {
            protocol: protocol.into(),
            handlers: Vec::new(),
            config: RpcServerConfig::default(),
        }
    }

    pub fn protocol(&self) -> &Arc<RpcProtocol> {
        &self.dispatcher.protocol
    }

    pub fn config(&self) -> &RpcServerConfig {
        &self.config
    }

    pub(crate) fn dispatcher(&self) -> Arc<Dispatcher> {
        self.dispatcher.clone()
    }

    /// Bind `addr` and start accepting connections in the background.
    pub async fn listen(&self, addr: SocketAddr) -> Result<RpcServerHandle> {
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;

        info!(
            "RPC server listening on {} ({} handler(s), protocol {})",
            addr,
            self.dispatcher.routes.len(),
            self.dispatcher.protocol.fingerprint()
        );

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let (conn_shutdown_tx, conn_shutdown_rx) = watch::channel(false);
        let active_connections = Arc::new(AtomicUsize::new(0));

        let accept_loop = AcceptLoop {
            listener,
            dispatcher: self.dispatcher.clone(),
            config: self.config.clone(),
            conn_shutdown: conn_shutdown_rx,
            active_connections: active_connections.clone(),
        };
        let task_handle = tokio::spawn(accept_loop.run(shutdown_rx));

        Ok(RpcServerHandle {
            addr,
            shutdown_tx: Some(shutdown_tx),
            conn_shutdown_tx,
            task_handle: Some(task_handle),
            active_connections,
            max_connections: self.config.max_connections,
        })
    }
}

/// Handle to a running server. Dropping it shuts the server down.
pub struct RpcServerHandle {
    addr: SocketAddr,
    shutdown_tx: Option<oneshot::Sender<()>>,
    conn_shutdown_tx: watch::Sender<bool>,
    task_handle: Option<JoinHandle<()>>,
    active_connections: Arc<AtomicUsize>,
    max_connections: usize,
}

impl RpcServerHandle {
    /// Address the server is listening on.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn connection_count(&self) -> usize {
        self.active_connections.load(Ordering::Relaxed)
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    /// Signal shutdown without waiting.
    ///
    /// Stops accepting and tells every connected client to close.
    pub fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        let _ = self.conn_shutdown_tx.send(true);
    }

    /// Shut down gracefully and wait until every connection has drained.
    ///
    /// Connections still open after the configured shutdown timeout are aborted.
    pub async fn close(mut self) {
        self.shutdown();
        if let Some(handle) = self.task_handle.take() {
            if let Err(e) = handle.await {
                error!("RPC server accept loop failed: {}", e);
            }
        }
    }
}

impl Drop for RpcServerHandle {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(handle) = self.task_handle.take() {
            handle.abort();
        }
    }
}

struct AcceptLoop {
    listener: TcpListener,
    dispatcher: Arc<Dispatcher>,
    config: RpcServerConfig,
    conn_shutdown: watch::Receiver<bool>,
    active_connections: Arc<AtomicUsize>,
}

impl AcceptLoop {
    async fn run(self, mut shutdown_rx: oneshot::Receiver<()>) {
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    info!("RPC server shutting down");
                    break;
                }
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                accept_result = self.listener.accept() => {
                    match accept_result {
                        Ok((stream, peer_addr)) => {
                            let current = self.active_connections.load(Ordering::Relaxed);
                            if current >= self.config.max_connections {
                                warn!(
                                    "Rejecting RPC connection from {}: at max capacity ({})",
                                    peer_addr,
                                    self.config.max_connections
                                );
                                continue;
                            }
                            if let Err(e) = stream.set_nodelay(true) {
                                debug!("Failed to set TCP_NODELAY for {}: {}", peer_addr, e);
                            }

                            self.active_connections.fetch_add(1, Ordering::Relaxed);
                            let dispatcher = self.dispatcher.clone();
                            let conns = self.active_connections.clone();
                            let conn_shutdown = self.conn_shutdown.clone();
                            let max_frame_size = self.config.max_frame_size;

                            connections.spawn(async move {
                                debug!("RPC connection from {}", peer_addr);
                                if let Err(e) = connection::serve_connection(
                                    stream,
                                    peer_addr,
                                    dispatcher,
                                    max_frame_size,
                                    conn_shutdown,
                                )
                                .await
                                {
                                    warn!("RPC connection {} closed: {}", peer_addr, e);
                                }
                                conns.fetch_sub(1, Ordering::Relaxed);
                            });
                        }
                        Err(e) => {
                            error!("RPC accept error: {}", e);
                        }
                    }
                }
            }
        }

        let Self {
            listener,
            config,
            active_connections,
            ..
        } = self;
        drop(listener);
        drain(connections, config.shutdown_timeout, &active_connections).await;
    }
}

async fn drain(mut connections: JoinSet<()>, timeout: Duration, active_connections: &AtomicUsize) {
    if connections.is_empty() {
        return;
    }
    info!("Waiting for {} RPC connection(s) to drain", connections.len());

    let drained = tokio::time::timeout(timeout, async {
        while connections.join_next().await.is_some() {}
    })
    .await;

    if drained.is_err() {
        warn!(
            "Aborting {} RPC connection(s) still open after {:?}",
            connections.len(),
            timeout
        );
        connections.shutdown().await;
        active_connections.store(0, Ordering::Relaxed);
    }
}
