use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;

use super::RpcStrategy;
use crate::client::pool::PoolSnapshot;
use crate::client::sender::RpcSender;

/// Routes to one endpoint, available while it is connected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SingleServer {
    address: SocketAddr,
}

impl SingleServer {
    pub fn address(&self) -> SocketAddr {
        self.address
    }
}

pub fn server(address: SocketAddr) -> SingleServer {
    SingleServer { address }
}

/// One single-endpoint strategy per address, in order.
pub fn servers(addresses: impl IntoIterator<Item = SocketAddr>) -> Vec<Arc<dyn RpcStrategy>> {
    addresses
        .into_iter()
        .map(|address| server(address).into_shared())
        .collect()
}

impl RpcStrategy for SingleServer {
    fn addresses(&self) -> HashSet<SocketAddr> {
        HashSet::from([self.address])
    }

    fn create_sender(&self, pool: &PoolSnapshot) -> Option<Arc<dyn RpcSender>> {
        pool.get(&self.address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::testing::{addr, pool_with, FakeSender};

    #[test]
    fn test_available_only_when_connected() {
        let strategy = server(addr(1));
        let pool = pool_with(&[(2, FakeSender::new("b"))]);
        assert!(strategy.create_sender(&pool.snapshot()).is_none());

        pool.put(addr(1), FakeSender::new("a"));
        assert!(strategy.create_sender(&pool.snapshot()).is_some());
        assert_eq!(strategy.addresses(), HashSet::from([addr(1)]));
    }

    #[test]
    fn test_servers_preserves_order() {
        let strategies = servers([addr(3), addr(1)]);
        assert_eq!(strategies.len(), 2);
        assert_eq!(strategies[0].addresses(), HashSet::from([addr(3)]));
    }
}
