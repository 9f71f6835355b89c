//! Kestrel RPC - multiplexed request/response messaging over TCP.
//!
//! Many requests share one connection per endpoint and are matched to their
//! responses by correlation id, so responses may arrive in any order. On the
//! client, a routing [`strategy`] turns the current set of live connections
//! into a sender for each call: single server, round-robin, failover,
//! sharding, rendezvous hashing, first-valid fan-out, or per-type dispatch,
//! nested as needed.
//!
//! # Example
//!
//! ```rust,no_run
//! use kestrel_rpc::server::{handler_fn, HandlerError};
//! use kestrel_rpc::{strategy, RpcClient, RpcProtocol, RpcServer};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> kestrel_rpc::Result<()> {
//!     let protocol = RpcProtocol::builder().register::<String, String>().build()?;
//!
//!     let server = RpcServer::builder(protocol.clone())
//!         .with_handler::<String, String, _>(handler_fn(|name: String| async move {
//!             Ok::<_, HandlerError>(format!("hello, {name}"))
//!         }))
//!         .build()?;
//!     let handle = server.listen("127.0.0.1:0".parse().unwrap()).await?;
//!
//!     let client = RpcClient::builder(protocol, strategy::server(handle.addr())).build();
//!     client.start().await?;
//!     let greeting: String = client
//!         .send_request("kestrel".to_string(), Duration::from_secs(1))
//!         .await?;
//!     println!("{greeting}");
//!
//!     client.stop().await;
//!     handle.close().await;
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod protocol;
pub mod server;
pub mod strategy;

// Re-export commonly used types
pub use client::{BlockingRpcClient, Callback, ConnectionPool, PoolSnapshot, RpcClient, RpcSender};
pub use codec::{JsonCodec, MessageCodec};
pub use config::{RpcClientConfig, RpcConfig, RpcServerConfig};
pub use error::{Result, RpcError};
pub use protocol::{Request, Response, RpcProtocol, TypeTag};
pub use server::{RpcServer, RpcServerHandle};
pub use strategy::RpcStrategy;
