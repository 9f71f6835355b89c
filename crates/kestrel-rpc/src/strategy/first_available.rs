use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;

use super::{union_addresses, RpcStrategy};
use crate::client::pool::PoolSnapshot;
use crate::client::sender::RpcSender;

/// Fail-over: the first sub-strategy, in list order, that is available.
pub struct FirstAvailable {
    strategies: Vec<Arc<dyn RpcStrategy>>,
}

pub fn first_available(strategies: Vec<Arc<dyn RpcStrategy>>) -> FirstAvailable {
    FirstAvailable { strategies }
}

impl RpcStrategy for FirstAvailable {
    fn addresses(&self) -> HashSet<SocketAddr> {
        union_addresses(&self.strategies)
    }

    fn create_sender(&self, pool: &PoolSnapshot) -> Option<Arc<dyn RpcSender>> {
        self.strategies
            .iter()
            .find_map(|strategy| strategy.create_sender(pool))
    }
}
