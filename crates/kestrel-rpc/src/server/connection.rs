//! Server side of one client connection.
//!
//! Each request runs in its own task; responses are queued as handlers
//! finish, so they may leave in a different order than requests arrived.
//! Writes never block the loop. While the write queue is backed up the loop
//! stops reading new requests, which pushes back on the client without
//! stalling responses. When the server shuts down the connection announces
//! `Close`, keeps answering what it already accepted, and ends once the
//! client hangs up.

use std::net::SocketAddr;
use std::sync::Arc;

use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_util::codec::FramedRead;
use tracing::{debug, trace, warn};

use super::handler::run_guarded;
use super::Dispatcher;
use crate::error::{Result, RpcError};
use crate::protocol::outbound::{outbound, Outbound};
use crate::protocol::{ControlMessage, Frame, FrameCodec, RemoteExceptionEnvelope};

pub(crate) async fn serve_connection<S>(
    stream: S,
    peer: SocketAddr,
    dispatcher: Arc<Dispatcher>,
    max_frame_size: usize,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read_half, write_half) = tokio::io::split(stream);
    let mut reader = FramedRead::new(read_half, FrameCodec::new(max_frame_size));
    let (mut outbound, writer) = outbound(write_half, max_frame_size);
    tokio::pin!(writer);

    let mut in_flight: JoinSet<Frame> = JoinSet::new();
    let mut reading = true;
    let mut closing = false;

    if *shutdown.borrow_and_update() {
        closing = true;
        outbound.push(ControlMessage::Close.into_frame())?;
    }

    loop {
        if !reading && in_flight.is_empty() && outbound.is_idle() {
            drop(outbound);
            writer.await?;
            debug!("Connection from {} finished", peer);
            return Ok(());
        }

        tokio::select! {
            frame = reader.next(), if reading && outbound.is_idle() => match frame {
                Some(Ok(frame)) => dispatch(&dispatcher, frame, &mut in_flight)?,
                Some(Err(err)) => return Err(err),
                None => reading = false,
            },
            Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => match joined {
                Ok(frame) => queue_response(&mut outbound, frame)?,
                Err(err) => warn!("Handler task for {} ended abnormally: {}", peer, err),
            },
            permit = outbound.ready(), if !outbound.is_idle() => outbound.forward(permit?, |_| true),
            written = &mut writer => {
                written?;
                return Err(RpcError::ConnectionClosed);
            }
            _ = shutdown.changed(), if !closing => {
                closing = true;
                debug!("Announcing shutdown to {}", peer);
                outbound.push(ControlMessage::Close.into_frame())?;
            }
        }
    }
}

/// Decode one inbound frame and start its handler.
///
/// Unknown or non-request tags and undecodable payloads are protocol
/// violations and end the connection.
fn dispatch(dispatcher: &Dispatcher, frame: Frame, in_flight: &mut JoinSet<Frame>) -> Result<()> {
    let Frame {
        correlation_id,
        type_tag,
        payload,
    } = frame;

    if !type_tag.is_request() || dispatcher.protocol.type_name(type_tag).is_none() {
        return Err(RpcError::protocol(format!(
            "unexpected type tag {} from client",
            type_tag
        )));
    }
    let value = dispatcher.protocol.decode_value(type_tag, &payload)?;
    trace!(correlation_id, tag = type_tag.0, "dispatching request");

    let Some(route) = dispatcher.routes.get(&type_tag) else {
        let type_name = dispatcher.protocol.type_name(type_tag).unwrap_or("unknown");
        let envelope = RemoteExceptionEnvelope::new(
            "kestrel_rpc::NoHandler",
            format!("no handler registered for {}", type_name),
        );
        in_flight.spawn(async move { envelope.into_frame(correlation_id) });
        return Ok(());
    };

    let handler = route.handler.clone();
    let response_tag = route.response_tag;
    let protocol = dispatcher.protocol.clone();
    in_flight.spawn(async move {
        match run_guarded(handler(value)).await {
            Ok(response) => match protocol.encode_value(response_tag, &*response) {
                Ok(payload) => Frame::new(correlation_id, response_tag, payload),
                Err(err) => RemoteExceptionEnvelope::new("kestrel_rpc::SerializationError", err.to_string())
                    .into_frame(correlation_id),
            },
            Err(err) => RemoteExceptionEnvelope::from(err).into_frame(correlation_id),
        }
    });
    Ok(())
}

fn queue_response(outbound: &mut Outbound, frame: Frame) -> Result<()> {
    let correlation_id = frame.correlation_id;
    match outbound.push(frame) {
        Err(err @ RpcError::FrameTooLarge { .. }) => {
            // The oversized response never reached the wire; report it instead.
            let envelope = RemoteExceptionEnvelope::new("kestrel_rpc::FrameTooLarge", err.to_string());
            outbound.push(envelope.into_frame(correlation_id))
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::connection::{spawn_connection, ConnectionContext};
    use crate::client::pool::ConnectionPool;
    use crate::client::sender::{callback_channel, RpcSender};
    use crate::config::RpcClientConfig;
    use crate::protocol::{RpcProtocol, TypeTag};
    use crate::server::{handler_fn, HandlerError, RpcServer};
    use futures::SinkExt;
    use std::time::Duration;
    use tokio::io::DuplexStream;
    use tokio::task::JoinHandle;
    use tokio_util::codec::Framed;

    fn protocol() -> Arc<RpcProtocol> {
        Arc::new(
            RpcProtocol::builder()
                .register::<String, String>()
                .register::<u64, u64>()
                .register::<u32, String>()
                .register::<bool, bool>()
                .build()
                .unwrap(),
        )
    }

    fn peer() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 9000))
    }

    struct Harness {
        protocol: Arc<RpcProtocol>,
        client: Framed<DuplexStream, FrameCodec>,
        task: JoinHandle<Result<()>>,
        shutdown: watch::Sender<bool>,
    }

    fn server(protocol: Arc<RpcProtocol>) -> RpcServer {
        RpcServer::builder(protocol)
            .with_handler::<String, String, _>(handler_fn(|text: String| async move {
                Ok::<_, HandlerError>(text.to_uppercase())
            }))
            .with_handler::<u64, u64, _>(handler_fn(|millis: u64| async move {
                tokio::time::sleep(Duration::from_millis(millis)).await;
                Ok::<_, HandlerError>(millis)
            }))
            .with_handler::<u32, String, _>(handler_fn(|len: u32| async move {
                Ok::<_, HandlerError>("x".repeat(len as usize))
            }))
            .build()
            .unwrap()
    }

    fn harness() -> Harness {
        let protocol = protocol();
        let server = server(protocol.clone());

        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(serve_connection(
            server_io,
            peer(),
            server.dispatcher(),
            1024,
            shutdown_rx,
        ));
        Harness {
            protocol,
            client: Framed::new(client_io, FrameCodec::default()),
            task,
            shutdown,
        }
    }

    impl Harness {
        async fn request<T: std::any::Any + Send + Sync>(&mut self, id: u32, value: T) {
            let request = self.protocol.request(value).unwrap();
            self.client
                .send(Frame::new(id, request.tag(), request.payload().clone()))
                .await
                .unwrap();
        }

        async fn next(&mut self) -> Frame {
            self.client.next().await.unwrap().unwrap()
        }
    }

    #[tokio::test]
    async fn test_request_gets_response_with_same_id() {
        let mut h = harness();
        h.request(7, "abc".to_string()).await;
        let frame = h.next().await;
        assert_eq!(frame.correlation_id, 7);
        assert_eq!(frame.type_tag, TypeTag(3));
        let response = h.protocol.decode_response(frame.type_tag, &frame.payload).unwrap();
        assert_eq!(response.downcast::<String>().unwrap(), "ABC");
    }

    #[tokio::test(start_paused = true)]
    async fn test_responses_in_completion_order() {
        let mut h = harness();
        h.request(1, 300u64).await;
        h.request(2, 100u64).await;
        h.request(3, 200u64).await;

        let ids = [h.next().await, h.next().await, h.next().await].map(|frame| frame.correlation_id);
        assert_eq!(ids, [2, 3, 1]);
    }

    #[tokio::test]
    async fn test_registered_type_without_handler_is_remote_exception() {
        let mut h = harness();
        h.request(4, true).await;
        let frame = h.next().await;
        assert_eq!(frame.type_tag, TypeTag::REMOTE_EXCEPTION);
        let envelope = RemoteExceptionEnvelope::decode(&frame.payload).unwrap();
        assert_eq!(envelope.class_name, "kestrel_rpc::NoHandler");
    }

    #[tokio::test]
    async fn test_unknown_tag_closes_connection() {
        let mut h = harness();
        h.client.send(Frame::new(1, TypeTag(40), "x")).await.unwrap();
        let result = h.task.await.unwrap();
        assert!(matches!(result, Err(err) if err.is_protocol_violation()));
        assert!(h.client.next().await.is_none());
    }

    #[tokio::test]
    async fn test_response_tag_from_client_is_violation() {
        let mut h = harness();
        h.client.send(Frame::new(1, TypeTag(3), "\"x\"")).await.unwrap();
        assert!(h.task.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_undecodable_payload_closes_connection() {
        let mut h = harness();
        h.client.send(Frame::new(1, TypeTag(2), "not json")).await.unwrap();
        assert!(matches!(h.task.await.unwrap(), Err(RpcError::Serialization { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_announces_close_and_drains() {
        let mut h = harness();
        h.request(1, 50u64).await;
        // Let the server pick up the request before shutting down.
        tokio::time::sleep(Duration::from_millis(1)).await;
        h.shutdown.send(true).unwrap();

        let close = h.next().await;
        assert_eq!(close.type_tag, TypeTag::CONTROL);
        assert_eq!(ControlMessage::decode(&close.payload).unwrap(), ControlMessage::Close);

        let response = h.next().await;
        assert_eq!(response.correlation_id, 1);

        drop(h.client);
        assert!(h.task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_oversized_response_reported_as_exception() {
        let mut h = harness();
        h.request(9, 2000u32).await;
        let frame = h.next().await;
        assert_eq!(frame.correlation_id, 9);
        assert_eq!(frame.type_tag, TypeTag::REMOTE_EXCEPTION);
        let envelope = RemoteExceptionEnvelope::decode(&frame.payload).unwrap();
        assert_eq!(envelope.class_name, "kestrel_rpc::FrameTooLarge");
    }

    #[tokio::test]
    async fn test_bulk_echo_over_small_buffer_completes() {
        const MAX_FRAME: usize = 256 * 1024;
        let protocol = protocol();
        let (client_io, server_io) = tokio::io::duplex(16 * 1024);

        let (_server_shutdown, server_shutdown_rx) = watch::channel(false);
        let serving = tokio::spawn(serve_connection(
            server_io,
            peer(),
            server(protocol.clone()).dispatcher(),
            MAX_FRAME,
            server_shutdown_rx,
        ));

        let (_client_shutdown, client_shutdown_rx) = watch::channel(false);
        let config = RpcClientConfig::default().with_max_frame_size(MAX_FRAME);
        let context = ConnectionContext::new(
            protocol.clone(),
            Arc::new(ConnectionPool::new()),
            &config,
            client_shutdown_rx,
        );
        let (connection, _driver) = spawn_connection(client_io, peer(), context);

        let receivers: Vec<_> = (0..64)
            .map(|i| {
                let (callback, receiver) = callback_channel();
                let text = format!("{:02}", i).repeat(32 * 1024);
                connection.send_request(protocol.request(text).unwrap(), Duration::from_secs(10), callback);
                receiver
            })
            .collect();

        let all = async {
            for (i, receiver) in receivers.into_iter().enumerate() {
                let echoed = receiver.recv().await.unwrap().downcast::<String>().unwrap();
                assert_eq!(echoed.len(), 64 * 1024);
                assert!(echoed.starts_with(&format!("{:02}", i)));
            }
        };
        tokio::time::timeout(Duration::from_secs(30), all)
            .await
            .expect("responses kept flowing");

        connection.close();
        assert!(serving.await.unwrap().is_ok());
    }
}
