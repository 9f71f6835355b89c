//! Routing strategies against several live servers.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::Duration;

use kestrel_rpc::server::{handler_fn, HandlerError};
use kestrel_rpc::strategy::{self, RpcStrategy};
use kestrel_rpc::{RpcClient, RpcClientConfig, RpcError, RpcProtocol, RpcServer, RpcServerHandle};
use serde::{Deserialize, Serialize};

/// Asks a server for its name.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct WhoAmI(u64);

/// Looks up a key that only some servers hold.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Lookup(String);

/// Command with no result.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Touch(String);

const TIMEOUT: Duration = Duration::from_secs(5);

fn protocol() -> RpcProtocol {
    RpcProtocol::builder()
        .register::<WhoAmI, String>()
        .register_optional::<Lookup, String>()
        .register::<Touch, ()>()
        .build()
        .expect("valid protocol")
}

/// Start a server named `name` that holds only `keys`.
async fn start_named(name: &'static str, keys: &'static [&'static str]) -> RpcServerHandle {
    RpcServer::builder(protocol())
        .with_handler::<WhoAmI, String, _>(handler_fn(move |_: WhoAmI| async move {
            Ok::<_, HandlerError>(name.to_string())
        }))
        .with_handler::<Lookup, Option<String>, _>(handler_fn(move |Lookup(key): Lookup| async move {
            let found = keys.contains(&key.as_str()).then(|| format!("{name}:{key}"));
            Ok::<_, HandlerError>(found)
        }))
        .with_handler::<Touch, (), _>(handler_fn(|_: Touch| async move { Ok::<_, HandlerError>(()) }))
        .build()
        .expect("valid handlers")
        .listen("127.0.0.1:0".parse().unwrap())
        .await
        .expect("bind")
}

fn key_of(request: &kestrel_rpc::Request) -> u64 {
    request.downcast_ref::<WhoAmI>().map(|who| who.0).unwrap_or(0)
}

async fn who(client: &RpcClient, key: u64) -> kestrel_rpc::Result<String> {
    client.send_request(WhoAmI(key), TIMEOUT).await
}

#[tokio::test]
async fn test_round_robin_alternates_between_servers() {
    let a = start_named("a", &[]).await;
    let b = start_named("b", &[]).await;

    let client = RpcClient::builder(protocol(), strategy::round_robin(strategy::servers([a.addr(), b.addr()])))
        .build();
    client.start().await.unwrap();

    let mut names = Vec::new();
    for key in 0..4 {
        names.push(who(&client, key).await.unwrap());
    }
    assert_ne!(names[0], names[1]);
    assert_eq!(names[0], names[2]);
    assert_eq!(names[1], names[3]);

    client.stop().await;
    a.close().await;
    b.close().await;
}

#[tokio::test]
async fn test_sharding_routes_by_key() {
    let a = start_named("a", &[]).await;
    let b = start_named("b", &[]).await;

    let routing = strategy::sharding(
        |request| key_of(request) as usize,
        strategy::servers([a.addr(), b.addr()]),
    );
    let client = RpcClient::builder(protocol(), routing).build();
    client.start().await.unwrap();

    for key in 0..6 {
        let expected = if key % 2 == 0 { "a" } else { "b" };
        assert_eq!(who(&client, key).await.unwrap(), expected);
    }

    client.stop().await;
    a.close().await;
    b.close().await;
}

#[tokio::test]
async fn test_sharding_with_one_shard_down() {
    let a = start_named("a", &[]).await;
    let b = start_named("b", &[]).await;
    let b_addr = b.addr();

    let routing = strategy::sharding(
        |request| key_of(request) as usize,
        strategy::servers([a.addr(), b_addr]),
    );
    let client = RpcClient::builder(protocol(), routing).build();
    client.start().await.unwrap();

    let mut pool = client.pool().subscribe();
    b.close().await;
    tokio::time::timeout(TIMEOUT, pool.wait_for(|snapshot| !snapshot.contains(&b_addr)))
        .await
        .expect("shard removed")
        .unwrap();

    // Shard 0 keeps serving; shard 1 is never rerouted.
    assert_eq!(who(&client, 2).await.unwrap(), "a");
    assert!(matches!(who(&client, 3).await, Err(RpcError::NoSenderAvailable)));

    client.stop().await;
    a.close().await;
}

#[tokio::test]
async fn test_first_available_fails_over() {
    let primary = start_named("primary", &[]).await;
    let backup = start_named("backup", &[]).await;
    let primary_addr = primary.addr();

    let routing = strategy::first_available(strategy::servers([primary_addr, backup.addr()]));
    let client = RpcClient::builder(protocol(), routing).build();
    client.start().await.unwrap();
    assert_eq!(who(&client, 0).await.unwrap(), "primary");

    let mut pool = client.pool().subscribe();
    primary.close().await;
    tokio::time::timeout(TIMEOUT, pool.wait_for(|snapshot| !snapshot.contains(&primary_addr)))
        .await
        .expect("primary removed")
        .unwrap();

    assert_eq!(who(&client, 0).await.unwrap(), "backup");

    client.stop().await;
    backup.close().await;
}

#[tokio::test]
async fn test_first_valid_result_finds_holder() {
    let a = start_named("a", &["apple"]).await;
    let b = start_named("b", &["banana"]).await;

    let routing = strategy::first_valid_result(strategy::servers([a.addr(), b.addr()]));
    let client = RpcClient::builder(protocol(), routing).build();
    client.start().await.unwrap();

    let found: Option<String> = client.send_request(Lookup("banana".into()), TIMEOUT).await.unwrap();
    assert_eq!(found.as_deref(), Some("b:banana"));

    let missing: kestrel_rpc::Result<Option<String>> =
        client.send_request(Lookup("cherry".into()), TIMEOUT).await;
    assert!(matches!(missing, Err(RpcError::NoValidResult { .. })));

    client.stop().await;
    a.close().await;
    b.close().await;
}

#[tokio::test]
async fn test_first_valid_result_accepts_unit_commands() {
    let a = start_named("a", &[]).await;
    let b = start_named("b", &[]).await;

    let routing = strategy::first_valid_result(strategy::servers([a.addr(), b.addr()]));
    let client = RpcClient::builder(protocol(), routing).build();
    client.start().await.unwrap();

    let touched: kestrel_rpc::Result<()> = client.send_request(Touch("k".into()), TIMEOUT).await;
    assert!(touched.is_ok(), "{:?}", touched);

    client.stop().await;
    a.close().await;
    b.close().await;
}

#[tokio::test]
async fn test_rendezvous_is_stable_per_key() {
    let servers = [
        start_named("a", &[]).await,
        start_named("b", &[]).await,
        start_named("c", &[]).await,
    ];

    let routing = servers.iter().fold(
        strategy::rendezvous_hashing(key_of),
        |routing, server| routing.with_server(server.addr()),
    );
    let client = RpcClient::builder(protocol(), routing).build();
    client.start().await.unwrap();

    let mut seen = HashSet::new();
    for key in 0..32 {
        let first = who(&client, key).await.unwrap();
        assert_eq!(who(&client, key).await.unwrap(), first);
        seen.insert(first);
    }
    assert!(seen.len() > 1, "all keys landed on {:?}", seen);

    client.stop().await;
    for server in servers {
        server.close().await;
    }
}

#[tokio::test]
async fn test_type_dispatching_splits_by_request_type() {
    let names = start_named("names", &[]).await;
    let store = start_named("store", &["k"]).await;

    let routing = strategy::type_dispatching()
        .on::<WhoAmI>(strategy::server(names.addr()).into_shared())
        .on::<Lookup>(strategy::server(store.addr()).into_shared());
    assert_eq!(routing.addresses().len(), 2);

    let client = RpcClient::builder(protocol(), routing).build();
    client.start().await.unwrap();

    assert_eq!(who(&client, 0).await.unwrap(), "names");
    let found: Option<String> = client.send_request(Lookup("k".into()), TIMEOUT).await.unwrap();
    assert_eq!(found.as_deref(), Some("store:k"));

    client.stop().await;
    names.close().await;
    store.close().await;
}

#[tokio::test]
async fn test_forced_start_picks_up_late_server() {
    // Reserve a port, then free it so the client starts with nothing to reach.
    let addr: SocketAddr = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    };

    let client = RpcClient::builder(protocol(), strategy::server(addr))
        .with_config(
            RpcClientConfig::default()
                .with_forced_start(true)
                .with_reconnect(
                    kestrel_rpc::client::ReconnectConfig::new()
                        .with_base_delay(Duration::from_millis(20))
                        .with_max_delay(Duration::from_millis(50))
                        .with_jitter(false),
                ),
        )
        .build();
    client.start().await.unwrap();
    assert!(matches!(who(&client, 0).await, Err(RpcError::NoSenderAvailable)));

    let late = RpcServer::builder(protocol())
        .with_handler::<WhoAmI, String, _>(handler_fn(|_: WhoAmI| async move {
            Ok::<_, HandlerError>("late".to_string())
        }))
        .build()
        .unwrap()
        .listen(addr)
        .await
        .unwrap();

    let mut pool = client.pool().subscribe();
    tokio::time::timeout(TIMEOUT, pool.wait_for(|snapshot| snapshot.contains(&addr)))
        .await
        .expect("connected")
        .unwrap();
    assert_eq!(who(&client, 0).await.unwrap(), "late");

    client.stop().await;
    late.close().await;
}
