//! Strategy selection for `kestrel-node call`.

use std::net::SocketAddr;
use std::sync::Arc;

use clap::ValueEnum;
use kestrel_rpc::strategy::{self, RpcStrategy};

use crate::kv::key_hash;

/// Routing strategy chosen on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StrategyKind {
    /// Rotate over connected servers.
    RoundRobin,
    /// First connected server in the order given.
    FirstAvailable,
    /// `hash(key) mod N` over the servers in the order given.
    Sharding,
    /// Rendezvous hashing on the key; minimal movement when servers change.
    Rendezvous,
    /// Ask every server; answer with the first non-empty result.
    FirstValid,
}

/// Build the strategy for `servers`.
pub fn build(kind: StrategyKind, servers: &[SocketAddr]) -> Arc<dyn RpcStrategy> {
    let leaves = strategy::servers(servers.iter().copied());
    match kind {
        StrategyKind::RoundRobin => strategy::round_robin(leaves).into_shared(),
        StrategyKind::FirstAvailable => strategy::first_available(leaves).into_shared(),
        StrategyKind::Sharding => {
            strategy::sharding(|request| key_hash(request) as usize, leaves).into_shared()
        }
        StrategyKind::Rendezvous => servers
            .iter()
            .fold(strategy::rendezvous_hashing(key_hash), |routing, &addr| {
                routing.with_server(addr)
            })
            .into_shared(),
        StrategyKind::FirstValid => strategy::first_valid_result(leaves).into_shared(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_kind_covers_all_servers() {
        let servers: Vec<SocketAddr> = vec![
            "127.0.0.1:7001".parse().unwrap(),
            "127.0.0.1:7002".parse().unwrap(),
        ];
        for kind in StrategyKind::value_variants() {
            let routing = build(*kind, &servers);
            assert_eq!(routing.addresses().len(), 2, "{:?}", kind);
        }
    }

    #[test]
    fn test_kind_names_on_command_line() {
        let kind = StrategyKind::from_str("first-valid", false).unwrap();
        assert_eq!(kind, StrategyKind::FirstValid);
    }
}
