//! Kestrel Node - key-value demo server and client for Kestrel RPC.
//!
//! `serve` runs one in-memory key-value node; `call` connects to one or more
//! nodes through a routing strategy and issues a single request.

mod kv;
mod routing;

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use kestrel_rpc::{RpcClient, RpcConfig, RpcServerConfig};
use serde::Serialize;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use routing::StrategyKind;

#[derive(Parser, Debug)]
#[command(name = "kestrel-node")]
#[command(about = "Key-value node speaking Kestrel RPC")]
struct Args {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a key-value node until interrupted
    Serve {
        /// Port to listen on (0 = auto-assign)
        #[arg(short, long, default_value = "0")]
        port: u16,

        /// Host to bind to
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        /// Maximum concurrent client connections
        #[arg(long, default_value_t = RpcConfig::MAX_SERVER_CONNECTIONS)]
        max_connections: usize,
    },
    /// Send one request through a routing strategy
    Call {
        /// Node address; repeat for several nodes
        #[arg(short, long = "server", required = true)]
        servers: Vec<SocketAddr>,

        /// How requests are routed across nodes
        #[arg(long, value_enum, default_value = "round-robin")]
        strategy: StrategyKind,

        /// Request timeout in milliseconds
        #[arg(long, default_value_t = RpcConfig::DEFAULT_REQUEST_TIMEOUT.as_millis() as u64)]
        timeout_ms: u64,

        #[command(subcommand)]
        op: Op,
    },
}

#[derive(Subcommand, Debug)]
enum Op {
    /// Store a value
    Put { key: String, value: String },
    /// Read a value
    Get { key: String },
    /// Remove a value
    Delete { key: String },
    /// Ask the node to fail with a message
    Fail { message: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging
    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    match args.command {
        Command::Serve {
            port,
            host,
            max_connections,
        } => serve(&host, port, max_connections).await,
        Command::Call {
            servers,
            strategy,
            timeout_ms,
            op,
        } => call(&servers, strategy, Duration::from_millis(timeout_ms), op).await,
    }
}

async fn serve(host: &str, port: u16, max_connections: usize) -> Result<()> {
    let addr: SocketAddr = format!("{}:{}", host, port)
        .parse()
        .with_context(|| format!("invalid listen address {}:{}", host, port))?;

    let store = kv::Store::default();
    let config = RpcServerConfig::default().with_max_connections(max_connections);
    let handle = kv::server(store.clone(), config)?.listen(addr).await?;

    // Print port for launchers to read (intentional stdout)
    println!("RPC_PORT={}", handle.addr().port());
    info!("Key-value node running on {}", handle.addr());

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, draining connections");
    handle.close().await;
    info!("Stopped with {} key(s) stored", store.len().await);

    Ok(())
}

async fn call(servers: &[SocketAddr], kind: StrategyKind, timeout: Duration, op: Op) -> Result<()> {
    let client = RpcClient::builder(kv::protocol()?, routing::build(kind, servers)).build();
    client
        .start()
        .await
        .context("no node reachable for the chosen strategy")?;

    let result = async {
        match op {
            Op::Put { key, value } => {
                let previous: Option<String> = client.send_request(kv::Put { key, value }, timeout).await?;
                print_json(&previous)
            }
            Op::Get { key } => {
                let value: Option<String> = client.send_request(kv::Get { key }, timeout).await?;
                print_json(&value)
            }
            Op::Delete { key } => {
                let removed: bool = client.send_request(kv::Delete { key }, timeout).await?;
                print_json(&removed)
            }
            Op::Fail { message } => {
                let never: String = client.send_request(kv::Fail { message }, timeout).await?;
                print_json(&never)
            }
        }
    }
    .await;

    client.stop().await;
    result
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string(value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_defaults_to_library_timeout() {
        let args = Args::try_parse_from(["kestrel-node", "call", "-s", "127.0.0.1:7001", "get", "k"]).unwrap();
        let Command::Call { timeout_ms, strategy, .. } = args.command else {
            panic!("expected call");
        };
        assert_eq!(Duration::from_millis(timeout_ms), RpcConfig::DEFAULT_REQUEST_TIMEOUT);
        assert_eq!(strategy, StrategyKind::RoundRobin);
    }

    #[test]
    fn test_timeout_override() {
        let args = Args::try_parse_from([
            "kestrel-node",
            "call",
            "--timeout-ms",
            "250",
            "-s",
            "127.0.0.1:7001",
            "delete",
            "k",
        ])
        .unwrap();
        assert!(matches!(args.command, Command::Call { timeout_ms: 250, .. }));
    }
}
