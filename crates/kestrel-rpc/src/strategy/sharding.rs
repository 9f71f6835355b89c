use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tracing::trace;

use super::{union_addresses, RpcStrategy};
use crate::client::pool::PoolSnapshot;
use crate::client::sender::{Callback, RpcSender};
use crate::error::RpcError;
use crate::protocol::Request;

type ShardFn = Arc<dyn Fn(&Request) -> usize + Send + Sync>;

/// Routes each request to shard `shard_fn(request) mod shard_count`.
///
/// Shards are positional: the `i`-th sub-strategy serves shard `i`. A call
/// whose shard is down fails with [`RpcError::NoSenderAvailable`]; it is
/// never rerouted to another shard.
pub struct Sharding {
    shard_fn: ShardFn,
    strategies: Vec<Arc<dyn RpcStrategy>>,
    min_active: usize,
}

pub fn sharding<F>(shard_fn: F, strategies: Vec<Arc<dyn RpcStrategy>>) -> Sharding
where
    F: Fn(&Request) -> usize + Send + Sync + 'static,
{
    Sharding {
        shard_fn: Arc::new(shard_fn),
        strategies,
        min_active: 1,
    }
}

impl Sharding {
    /// Require at least `min_active` shards to be up (never fewer than one).
    pub fn with_min_active(mut self, min_active: usize) -> Self {
        self.min_active = min_active.max(1);
        self
    }

    pub fn shard_count(&self) -> usize {
        self.strategies.len()
    }
}

impl RpcStrategy for Sharding {
    fn addresses(&self) -> HashSet<SocketAddr> {
        union_addresses(&self.strategies)
    }

    fn create_sender(&self, pool: &PoolSnapshot) -> Option<Arc<dyn RpcSender>> {
        let shards: Vec<_> = self
            .strategies
            .iter()
            .map(|strategy| strategy.create_sender(pool))
            .collect();
        let active = shards.iter().filter(|shard| shard.is_some()).count();
        if active < self.min_active {
            return None;
        }
        Some(Arc::new(ShardingSender {
            shard_fn: self.shard_fn.clone(),
            shards,
        }))
    }
}

struct ShardingSender {
    shard_fn: ShardFn,
    shards: Vec<Option<Arc<dyn RpcSender>>>,
}

impl RpcSender for ShardingSender {
    fn send_request(&self, request: Request, timeout: Duration, callback: Callback) {
        let shard = (self.shard_fn)(&request) % self.shards.len();
        match &self.shards[shard] {
            Some(sender) => sender.send_request(request, timeout, callback),
            None => {
                trace!(shard, "shard unavailable for {}", request.type_name());
                callback(Err(RpcError::NoSenderAvailable))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::sender::callback_channel;
    use crate::strategy::servers;
    use crate::strategy::testing::{addr, pool_with, protocol, FakeSender};

    fn by_key(request: &Request) -> usize {
        request.downcast_ref::<u64>().copied().unwrap_or_default() as usize
    }

    #[tokio::test]
    async fn test_same_key_same_shard() {
        let a = FakeSender::new("a");
        let b = FakeSender::new("b");
        let pool = pool_with(&[(1, a.clone()), (2, b.clone())]);
        let sender = sharding(by_key, servers([addr(1), addr(2)]))
            .create_sender(&pool.snapshot())
            .unwrap();

        let protocol = protocol();
        for key in [4u64, 7, 4, 10, 7] {
            let (callback, receiver) = callback_channel();
            sender.send_request(protocol.request(key).unwrap(), Duration::from_secs(1), callback);
            let name = receiver.recv().await.unwrap().downcast::<String>().unwrap();
            assert_eq!(name, if key % 2 == 0 { "a" } else { "b" });
        }
        assert_eq!(a.call_count(), 3);
        assert_eq!(b.call_count(), 2);
    }

    #[tokio::test]
    async fn test_missing_shard_fails_call() {
        let pool = pool_with(&[(1, FakeSender::new("a"))]);
        let sender = sharding(by_key, servers([addr(1), addr(2)]))
            .create_sender(&pool.snapshot())
            .unwrap();

        let (callback, receiver) = callback_channel();
        sender.send_request(protocol().request(3u64).unwrap(), Duration::from_secs(1), callback);
        assert!(matches!(receiver.recv().await, Err(RpcError::NoSenderAvailable)));
    }

    #[test]
    fn test_min_active_shards() {
        let pool = pool_with(&[(1, FakeSender::new("a"))]);
        let strategy = sharding(by_key, servers([addr(1), addr(2)]));
        assert!(strategy.create_sender(&pool.snapshot()).is_some());

        let strict = sharding(by_key, servers([addr(1), addr(2)])).with_min_active(2);
        assert!(strict.create_sender(&pool.snapshot()).is_none());
        assert!(strategy.create_sender(&pool_with(&[]).snapshot()).is_none());
    }
}
