//! Rendezvous (highest random weight) hashing over labelled shards.
//!
//! Requests hash into a fixed table of buckets. Each bucket belongs to the
//! available shard with the highest `blake3(bucket, label)` weight, so when a
//! shard goes away only its own buckets move, and when it comes back it
//! reclaims exactly those buckets.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use super::{server, RpcStrategy};
use crate::client::pool::PoolSnapshot;
use crate::client::sender::{Callback, RpcSender};
use crate::config::RpcConfig;
use crate::protocol::Request;

type HashFn = Arc<dyn Fn(&Request) -> u64 + Send + Sync>;

pub struct RendezvousHashing {
    hash_fn: HashFn,
    shards: Vec<(String, Arc<dyn RpcStrategy>)>,
    buckets: usize,
    min_active: usize,
}

/// Start an empty rendezvous strategy; add shards with `with_shard` or `with_server`.
pub fn rendezvous_hashing<F>(hash_fn: F) -> RendezvousHashing
where
    F: Fn(&Request) -> u64 + Send + Sync + 'static,
{
    RendezvousHashing {
        hash_fn: Arc::new(hash_fn),
        shards: Vec::new(),
        buckets: RpcConfig::RENDEZVOUS_BUCKETS,
        min_active: 1,
    }
}

impl RendezvousHashing {
    /// Add a shard under `label`, replacing any shard with the same label.
    pub fn with_shard(mut self, label: impl Into<String>, strategy: Arc<dyn RpcStrategy>) -> Self {
        let label = label.into();
        self.shards.retain(|(existing, _)| *existing != label);
        self.shards.push((label, strategy));
        self
    }

    /// Add a single endpoint as a shard labelled by its address.
    pub fn with_server(self, address: SocketAddr) -> Self {
        self.with_shard(address.to_string(), server(address).into_shared())
    }

    pub fn with_buckets(mut self, buckets: usize) -> Self {
        self.buckets = buckets.max(1);
        self
    }

    pub fn with_min_active(mut self, min_active: usize) -> Self {
        self.min_active = min_active.max(1);
        self
    }

    /// Bucket to shard-label assignment for `pool`, if the strategy is available.
    pub fn assignment(&self, pool: &PoolSnapshot) -> Option<Vec<String>> {
        let (labels, _) = self.derive(pool)?;
        Some(labels)
    }

    fn derive(&self, pool: &PoolSnapshot) -> Option<(Vec<String>, Vec<Arc<dyn RpcSender>>)> {
        let available: Vec<(&str, Arc<dyn RpcSender>)> = self
            .shards
            .iter()
            .filter_map(|(label, strategy)| {
                strategy
                    .create_sender(pool)
                    .map(|sender| (label.as_str(), sender))
            })
            .collect();
        if available.len() < self.min_active {
            return None;
        }

        let mut labels = Vec::with_capacity(self.buckets);
        let mut table = Vec::with_capacity(self.buckets);
        for bucket in 0..self.buckets {
            let (label, sender) = available
                .iter()
                .max_by_key(|(label, _)| (weight(bucket as u64, label), *label))?;
            labels.push(label.to_string());
            table.push(sender.clone());
        }
        Some((labels, table))
    }
}

fn weight(bucket: u64, label: &str) -> u64 {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&bucket.to_le_bytes());
    hasher.update(label.as_bytes());
    let digest = hasher.finalize();
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest.as_bytes()[..8]);
    u64::from_le_bytes(prefix)
}

impl RpcStrategy for RendezvousHashing {
    fn addresses(&self) -> HashSet<SocketAddr> {
        self.shards
            .iter()
            .flat_map(|(_, strategy)| strategy.addresses())
            .collect()
    }

    fn create_sender(&self, pool: &PoolSnapshot) -> Option<Arc<dyn RpcSender>> {
        let (_, table) = self.derive(pool)?;
        Some(Arc::new(RendezvousSender {
            hash_fn: self.hash_fn.clone(),
            table,
        }))
    }
}

struct RendezvousSender {
    hash_fn: HashFn,
    table: Vec<Arc<dyn RpcSender>>,
}

impl RpcSender for RendezvousSender {
    fn send_request(&self, request: Request, timeout: Duration, callback: Callback) {
        let bucket = (self.hash_fn)(&request) % self.table.len() as u64;
        self.table[bucket as usize].send_request(request, timeout, callback)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::sender::callback_channel;
    use crate::strategy::testing::{addr, pool_with, protocol, FakeSender};

    fn key(request: &Request) -> u64 {
        request.downcast_ref::<u64>().copied().unwrap_or_default()
    }

    fn three_servers() -> RendezvousHashing {
        rendezvous_hashing(key)
            .with_server(addr(1))
            .with_server(addr(2))
            .with_server(addr(3))
    }

    #[test]
    fn test_buckets_spread_over_shards() {
        let pool = pool_with(&[
            (1, FakeSender::new("a")),
            (2, FakeSender::new("b")),
            (3, FakeSender::new("c")),
        ]);
        let assignment = three_servers().assignment(&pool.snapshot()).unwrap();
        assert_eq!(assignment.len(), RpcConfig::RENDEZVOUS_BUCKETS);
        for port in 1..=3 {
            let owned = assignment
                .iter()
                .filter(|label| **label == addr(port).to_string())
                .count();
            assert!(owned > 200, "shard {} owns only {} buckets", port, owned);
        }
    }

    #[test]
    fn test_removal_moves_only_removed_buckets() {
        let pool = pool_with(&[
            (1, FakeSender::new("a")),
            (2, FakeSender::new("b")),
            (3, FakeSender::new("c")),
        ]);
        let strategy = three_servers();
        let before = strategy.assignment(&pool.snapshot()).unwrap();

        pool.remove(&addr(2));
        let after = strategy.assignment(&pool.snapshot()).unwrap();
        let removed = addr(2).to_string();

        for (old, new) in before.iter().zip(&after) {
            assert_ne!(*new, removed);
            if *old != removed {
                assert_eq!(old, new);
            }
        }

        pool.put(addr(2), FakeSender::new("b"));
        assert_eq!(strategy.assignment(&pool.snapshot()).unwrap(), before);
    }

    #[tokio::test]
    async fn test_same_key_same_sender() {
        let a = FakeSender::new("a");
        let b = FakeSender::new("b");
        let pool = pool_with(&[(1, a.clone()), (2, b.clone())]);
        let sender = rendezvous_hashing(key)
            .with_server(addr(1))
            .with_server(addr(2))
            .create_sender(&pool.snapshot())
            .unwrap();

        let protocol = protocol();
        let mut first = None;
        for _ in 0..5 {
            let (callback, receiver) = callback_channel();
            sender.send_request(protocol.request(42u64).unwrap(), Duration::from_secs(1), callback);
            let name = receiver.recv().await.unwrap().downcast::<String>().unwrap();
            assert_eq!(*first.get_or_insert_with(|| name.clone()), name);
        }
        assert_eq!(a.call_count() + b.call_count(), 5);
        assert!(a.call_count() == 0 || b.call_count() == 0);
    }

    #[test]
    fn test_unavailable_below_min_active() {
        let pool = pool_with(&[(1, FakeSender::new("a"))]);
        assert!(three_servers().create_sender(&pool.snapshot()).is_some());
        assert!(three_servers()
            .with_min_active(2)
            .create_sender(&pool.snapshot())
            .is_none());
        assert!(three_servers().create_sender(&pool_with(&[]).snapshot()).is_none());
    }

    #[test]
    fn test_duplicate_label_replaces_shard() {
        let strategy = rendezvous_hashing(key)
            .with_shard("x", server(addr(1)).into_shared())
            .with_shard("x", server(addr(2)).into_shared());
        assert_eq!(strategy.addresses(), HashSet::from([addr(2)]));
    }
}
