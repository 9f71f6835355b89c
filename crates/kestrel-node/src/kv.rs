//! Key-value messages, the in-memory store and its RPC handlers.

use std::collections::HashMap;
use std::sync::Arc;

use kestrel_rpc::server::{handler_fn, HandlerError};
use kestrel_rpc::{Request, RpcProtocol, RpcServer, RpcServerConfig};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;

// ============================================================================
// Messages
// ============================================================================

/// Store `value` under `key`; answers with the previous value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Put {
    pub key: String,
    pub value: String,
}

/// Read `key`; answers `None` when it is not stored here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Get {
    pub key: String,
}

/// Remove `key`; answers whether it was present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delete {
    pub key: String,
}

/// Always fails on the server with `message`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fail {
    pub message: String,
}

/// Registration table shared by `serve` and `call`.
pub fn protocol() -> kestrel_rpc::Result<RpcProtocol> {
    RpcProtocol::builder()
        .register_optional::<Put, String>()
        .register_optional::<Get, String>()
        .register::<Delete, bool>()
        .register::<Fail, String>()
        .build()
}

/// Key a request routes by, if it carries one.
pub fn request_key(request: &Request) -> Option<&str> {
    if let Some(put) = request.downcast_ref::<Put>() {
        Some(put.key.as_str())
    } else if let Some(get) = request.downcast_ref::<Get>() {
        Some(get.key.as_str())
    } else {
        request.downcast_ref::<Delete>().map(|delete| delete.key.as_str())
    }
}

/// Stable 64-bit hash of a request's key; keyless requests hash to 0.
pub fn key_hash(request: &Request) -> u64 {
    let Some(key) = request_key(request) else {
        return 0;
    };
    let digest = blake3::hash(key.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest.as_bytes()[..8]);
    u64::from_le_bytes(bytes)
}

// ============================================================================
// Store
// ============================================================================

/// In-memory store served by one node.
#[derive(Clone, Default)]
pub struct Store {
    entries: Arc<RwLock<HashMap<String, String>>>,
}

impl Store {
    pub async fn put(&self, key: String, value: String) -> Option<String> {
        self.entries.write().await.insert(key, value)
    }

    pub async fn get(&self, key: &str) -> Option<String> {
        self.entries.read().await.get(key).cloned()
    }

    pub async fn delete(&self, key: &str) -> bool {
        self.entries.write().await.remove(key).is_some()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

/// Build a server answering every key-value request from `store`.
pub fn server(store: Store, config: RpcServerConfig) -> kestrel_rpc::Result<RpcServer> {
    let put_store = store.clone();
    let get_store = store.clone();
    let delete_store = store;

    RpcServer::builder(protocol()?)
        .with_handler::<Put, Option<String>, _>(handler_fn(move |put: Put| {
            let store = put_store.clone();
            async move {
                debug!("put {}", put.key);
                Ok::<_, HandlerError>(store.put(put.key, put.value).await)
            }
        }))
        .with_handler::<Get, Option<String>, _>(handler_fn(move |get: Get| {
            let store = get_store.clone();
            async move { Ok::<_, HandlerError>(store.get(&get.key).await) }
        }))
        .with_handler::<Delete, bool, _>(handler_fn(move |delete: Delete| {
            let store = delete_store.clone();
            async move {
                debug!("delete {}", delete.key);
                Ok::<_, HandlerError>(store.delete(&delete.key).await)
            }
        }))
        .with_handler::<Fail, String, _>(handler_fn(|fail: Fail| async move {
            Err::<String, _>(HandlerError::new("kestrel_node::RequestedFailure", fail.message))
        }))
        .with_config(config)
        .build()
}
