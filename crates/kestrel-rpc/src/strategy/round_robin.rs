use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::{union_addresses, RpcStrategy};
use crate::client::pool::PoolSnapshot;
use crate::client::sender::{Callback, RpcSender};
use crate::protocol::Request;

/// Rotates calls across the sub-strategies that are currently available.
pub struct RoundRobin {
    strategies: Vec<Arc<dyn RpcStrategy>>,
    min_active: usize,
}

pub fn round_robin(strategies: Vec<Arc<dyn RpcStrategy>>) -> RoundRobin {
    RoundRobin {
        strategies,
        min_active: 1,
    }
}

impl RoundRobin {
    /// Require at least `min_active` available sub-strategies (never fewer than one).
    pub fn with_min_active(mut self, min_active: usize) -> Self {
        self.min_active = min_active.max(1);
        self
    }
}

impl RpcStrategy for RoundRobin {
    fn addresses(&self) -> HashSet<SocketAddr> {
        union_addresses(&self.strategies)
    }

    fn create_sender(&self, pool: &PoolSnapshot) -> Option<Arc<dyn RpcSender>> {
        let senders: Vec<_> = self
            .strategies
            .iter()
            .filter_map(|strategy| strategy.create_sender(pool))
            .collect();
        if senders.len() < self.min_active {
            return None;
        }
        Some(Arc::new(RoundRobinSender {
            senders,
            cursor: AtomicUsize::new(0),
        }))
    }
}

struct RoundRobinSender {
    senders: Vec<Arc<dyn RpcSender>>,
    cursor: AtomicUsize,
}

impl RpcSender for RoundRobinSender {
    fn send_request(&self, request: Request, timeout: Duration, callback: Callback) {
        let index = self.cursor.fetch_add(1, Ordering::Relaxed) % self.senders.len();
        self.senders[index].send_request(request, timeout, callback)
    }
}
