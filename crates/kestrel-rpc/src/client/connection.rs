//! Client side of one multiplexed connection.
//!
//! A connection is split in two: an [`RpcClientConnection`] handle that any
//! thread may use to submit requests, and a driver task that exclusively owns
//! the socket and the [`CorrelationTable`]. Handles reach the driver only
//! through a channel. The driver never awaits the socket for writes: frames
//! go through an [`Outbound`] queue so deadlines keep firing while a slow
//! peer holds up the writer.

use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tokio_util::codec::FramedRead;
use tracing::{debug, info, trace, warn};

use super::correlation::{deadline_after, CorrelationTable};
use super::pool::{ConnectionId, ConnectionPool};
use super::sender::{Callback, RpcSender};
use crate::config::RpcClientConfig;
use crate::error::{Result, RpcError};
use crate::protocol::outbound::{outbound, Outbound};
use crate::protocol::{
    ControlMessage, Frame, FrameCodec, RemoteExceptionEnvelope, Request, RpcProtocol, TypeTag,
};

enum Command {
    Send {
        request: Request,
        timeout: Duration,
        sent_at: Instant,
        callback: Callback,
    },
    Close,
}

/// Shared settings for every connection a client opens.
#[derive(Clone)]
pub(crate) struct ConnectionContext {
    pub protocol: Arc<RpcProtocol>,
    pub pool: Arc<ConnectionPool>,
    pub max_pending_requests: usize,
    pub max_frame_size: usize,
    pub shutdown: watch::Receiver<bool>,
}

impl ConnectionContext {
    pub fn new(
        protocol: Arc<RpcProtocol>,
        pool: Arc<ConnectionPool>,
        config: &RpcClientConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            protocol,
            pool,
            max_pending_requests: config.max_pending_requests,
            max_frame_size: config.max_frame_size,
            shutdown,
        }
    }
}

/// Handle to a live connection.
///
/// Cloning is cheap; all clones feed the same driver.
#[derive(Clone)]
pub struct RpcClientConnection {
    endpoint: SocketAddr,
    commands: mpsc::UnboundedSender<Command>,
    pending: Arc<AtomicUsize>,
    max_pending: usize,
}

impl RpcClientConnection {
    pub fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }

    /// Requests submitted through this connection and not yet resolved.
    pub fn active_requests(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    /// Close the connection. Requests still in flight fail with `ConnectionClosed`.
    pub fn close(&self) {
        let _ = self.commands.send(Command::Close);
    }
}

impl RpcSender for RpcClientConnection {
    fn send_request(&self, request: Request, timeout: Duration, callback: Callback) {
        let previous = self.pending.fetch_add(1, Ordering::AcqRel);
        if previous >= self.max_pending {
            self.pending.fetch_sub(1, Ordering::AcqRel);
            debug!(
                "Rejecting request to {}: {} requests in flight",
                self.endpoint, previous
            );
            callback(Err(RpcError::Overloaded { pending: previous }));
            return;
        }

        let counter = self.pending.clone();
        let callback: Callback = Box::new(move |result| {
            counter.fetch_sub(1, Ordering::AcqRel);
            callback(result)
        });

        let command = Command::Send {
            request,
            timeout,
            sent_at: Instant::now(),
            callback,
        };
        if let Err(mpsc::error::SendError(Command::Send { callback, .. })) =
            self.commands.send(command)
        {
            callback(Err(RpcError::ConnectionClosed));
        }
    }
}

impl fmt::Debug for RpcClientConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcClientConnection")
            .field("endpoint", &self.endpoint)
            .field("active_requests", &self.active_requests())
            .finish()
    }
}

/// Open a TCP connection to `endpoint`, register it in the pool and start its driver.
///
/// The returned join handle completes once the connection is closed and
/// deregistered.
pub(crate) async fn connect(
    endpoint: SocketAddr,
    connect_timeout: Duration,
    context: ConnectionContext,
) -> Result<(RpcClientConnection, JoinHandle<()>)> {
    let stream = tokio::time::timeout(connect_timeout, TcpStream::connect(endpoint))
        .await
        .map_err(|_| RpcError::Connect {
            endpoint,
            message: format!("timed out after {:?}", connect_timeout),
        })?
        .map_err(|e| RpcError::Connect {
            endpoint,
            message: e.to_string(),
        })?;
    stream.set_nodelay(true)?;

    info!("Connected to {}", endpoint);
    Ok(spawn_connection(stream, endpoint, context))
}

/// Register an already established stream and start its driver.
pub(crate) fn spawn_connection<S>(
    stream: S,
    endpoint: SocketAddr,
    context: ConnectionContext,
) -> (RpcClientConnection, JoinHandle<()>)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let handle = RpcClientConnection {
        endpoint,
        commands: commands_tx,
        pending: Arc::new(AtomicUsize::new(0)),
        max_pending: context.max_pending_requests,
    };

    let connection_id = context.pool.put(endpoint, Arc::new(handle.clone()));

    let (read_half, write_half) = tokio::io::split(stream);
    let (outbound, writer) = outbound(write_half, context.max_frame_size);
    let driver = ConnectionDriver {
        endpoint,
        connection_id,
        reader: FramedRead::new(read_half, FrameCodec::new(context.max_frame_size)),
        outbound,
        commands: commands_rx,
        commands_open: true,
        table: CorrelationTable::new(),
        server_closing: false,
        context,
    };

    (handle, tokio::spawn(driver.run(writer)))
}

/// Why a driver stopped.
enum Exit {
    ClosedByClient,
    ClosedByServer,
    Drained,
    Failed(RpcError),
}

impl fmt::Display for Exit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Exit::ClosedByClient => write!(f, "closed by client"),
            Exit::ClosedByServer => write!(f, "closed by peer"),
            Exit::Drained => write!(f, "drained after server close"),
            Exit::Failed(err) => write!(f, "{}", err),
        }
    }
}

struct ConnectionDriver<R> {
    endpoint: SocketAddr,
    connection_id: ConnectionId,
    reader: FramedRead<R, FrameCodec>,
    outbound: Outbound,
    commands: mpsc::UnboundedReceiver<Command>,
    commands_open: bool,
    table: CorrelationTable,
    /// Set once the server announced shutdown.
    server_closing: bool,
    context: ConnectionContext,
}

impl<R> ConnectionDriver<R>
where
    R: AsyncRead + Unpin,
{
    async fn run(mut self, writer: impl Future<Output = Result<()>>) {
        tokio::pin!(writer);
        let exit = self.event_loop(writer.as_mut()).await;
        match &exit {
            Exit::Failed(err) if err.is_protocol_violation() => {
                warn!("Connection to {} closed on protocol violation: {}", self.endpoint, err)
            }
            Exit::Failed(err) => warn!("Connection to {} failed: {}", self.endpoint, err),
            other => info!("Connection to {} {}", self.endpoint, other),
        }
        self.shutdown();
    }

    async fn event_loop<F>(&mut self, mut writer: Pin<&mut F>) -> Exit
    where
        F: Future<Output = Result<()>>,
    {
        let mut shutdown = self.context.shutdown.clone();
        if *shutdown.borrow_and_update() {
            return Exit::ClosedByClient;
        }

        loop {
            if (self.server_closing || !self.commands_open) && self.table.is_empty() {
                return if self.server_closing {
                    Exit::Drained
                } else {
                    Exit::ClosedByClient
                };
            }

            let deadline = self.table.next_deadline();
            let sleep_target = deadline.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

            tokio::select! {
                command = self.commands.recv(), if self.commands_open => match command {
                    Some(Command::Send { request, timeout, sent_at, callback }) => {
                        self.dispatch(request, timeout, sent_at, callback);
                    }
                    Some(Command::Close) => return Exit::ClosedByClient,
                    None => self.commands_open = false,
                },
                frame = self.reader.next() => match frame {
                    Some(Ok(frame)) => {
                        if let Err(err) = self.handle_frame(frame) {
                            return Exit::Failed(err);
                        }
                    }
                    Some(Err(err)) => return Exit::Failed(err),
                    None => return Exit::ClosedByServer,
                },
                permit = self.outbound.ready(), if !self.outbound.is_idle() => match permit {
                    Ok(permit) => {
                        // Requests that already timed out never reach the wire.
                        let table = &self.table;
                        self.outbound
                            .forward(permit, |frame| table.contains(frame.correlation_id));
                    }
                    Err(err) => return Exit::Failed(err),
                },
                written = &mut writer => {
                    return Exit::Failed(written.err().unwrap_or(RpcError::ConnectionClosed));
                }
                _ = sleep_until(sleep_target), if deadline.is_some() => {
                    let expired = self.table.expire(Instant::now());
                    if expired > 0 {
                        debug!("{} request(s) to {} timed out", expired, self.endpoint);
                    }
                }
                _ = shutdown.changed() => return Exit::ClosedByClient,
            }
        }
    }

    fn dispatch(&mut self, request: Request, timeout: Duration, sent_at: Instant, callback: Callback) {
        if self.server_closing {
            callback(Err(RpcError::ConnectionClosed));
            return;
        }
        if deadline_after(sent_at, timeout) <= Instant::now() {
            callback(Err(RpcError::Timeout(timeout)));
            return;
        }

        let id = self
            .table
            .register(request.response_tag(), timeout, sent_at, callback);
        trace!(
            correlation_id = id,
            request = request.type_name(),
            "sending to {}",
            self.endpoint
        );

        let frame = Frame::new(id, request.tag(), request.payload().clone());
        if let Err(err) = self.outbound.push(frame) {
            // Nothing was queued; only this request fails.
            if let Some(pending) = self.table.take(id) {
                pending.resolve(Err(err));
            }
        }
    }

    fn handle_frame(&mut self, frame: Frame) -> Result<()> {
        let Frame {
            correlation_id,
            type_tag,
            payload,
        } = frame;

        if type_tag == TypeTag::CONTROL {
            match ControlMessage::decode(&payload)? {
                ControlMessage::Close => self.on_server_close(),
            }
            return Ok(());
        }

        let Some(pending) = self.table.take(correlation_id) else {
            debug!(
                correlation_id,
                "Dropping response from {} for unknown or expired request", self.endpoint
            );
            return Ok(());
        };
        trace!(
            correlation_id,
            elapsed = ?pending.created.elapsed(),
            "response from {}",
            self.endpoint
        );

        if type_tag == TypeTag::REMOTE_EXCEPTION {
            return match RemoteExceptionEnvelope::decode(&payload) {
                Ok(envelope) => {
                    pending.resolve(Err(envelope.into()));
                    Ok(())
                }
                Err(err) => {
                    pending.resolve(Err(err.clone()));
                    Err(err)
                }
            };
        }

        if type_tag != pending.response_tag {
            let err = RpcError::protocol(format!(
                "expected response {} but received {}",
                pending.response_tag, type_tag
            ));
            pending.resolve(Err(err.clone()));
            return Err(err);
        }

        match self.context.protocol.decode_response(type_tag, &payload) {
            Ok(response) => {
                pending.resolve(Ok(response));
                Ok(())
            }
            Err(err) => {
                pending.resolve(Err(err.clone()));
                Err(err)
            }
        }
    }

    fn on_server_close(&mut self) {
        if self.server_closing {
            return;
        }
        self.server_closing = true;
        self.context
            .pool
            .remove_connection(&self.endpoint, self.connection_id);
        info!(
            "Server {} is closing; draining {} request(s)",
            self.endpoint,
            self.table.len()
        );
    }

    fn shutdown(&mut self) {
        self.context
            .pool
            .remove_connection(&self.endpoint, self.connection_id);

        self.commands.close();
        while let Ok(command) = self.commands.try_recv() {
            if let Command::Send { callback, .. } = command {
                callback(Err(RpcError::ConnectionClosed));
            }
        }

        let failed = self.table.fail_all(RpcError::ConnectionClosed);
        if failed > 0 {
            debug!(
                "Failed {} in-flight request(s) on closed connection to {}",
                failed, self.endpoint
            );
        }
    }
}
