//! Routing strategies.
//!
//! A strategy is an immutable policy that, given a [`PoolSnapshot`], derives
//! the [`RpcSender`] to use for new calls, or nothing when no route exists.
//! Leaf strategies name endpoints; combinators compose other strategies.
//! All per-call mutable state (round-robin cursors, fan-out aggregation)
//! lives in the derived sender, which is rebuilt whenever the pool changes.
//!
//! ```rust,no_run
//! use kestrel_rpc::strategy::{self, RpcStrategy};
//! use std::net::SocketAddr;
//!
//! let a: SocketAddr = "10.0.0.1:7070".parse().unwrap();
//! let b: SocketAddr = "10.0.0.2:7070".parse().unwrap();
//! let c: SocketAddr = "10.0.0.3:7070".parse().unwrap();
//!
//! // Two replicas per shard, fail over within each shard.
//! let routing = strategy::sharding(
//!     |request| request.payload().len(),
//!     vec![
//!         strategy::first_available(strategy::servers([a, b])).into_shared(),
//!         strategy::server(c).into_shared(),
//!     ],
//! );
//! assert_eq!(routing.addresses().len(), 3);
//! ```

mod first_available;
mod first_valid;
mod rendezvous;
mod round_robin;
mod sharding;
mod single;
mod type_dispatch;

pub use first_available::{first_available, FirstAvailable};
pub use first_valid::{first_valid_result, FirstValidResult, Validity};
pub use rendezvous::{rendezvous_hashing, RendezvousHashing};
pub use round_robin::{round_robin, RoundRobin};
pub use sharding::{sharding, Sharding};
pub use single::{server, servers, SingleServer};
pub use type_dispatch::{type_dispatching, TypeDispatching};

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::client::pool::PoolSnapshot;
use crate::client::sender::RpcSender;

/// Routing policy evaluated against pool snapshots.
pub trait RpcStrategy: Send + Sync {
    /// Every endpoint this strategy may route to; the client keeps these connected.
    fn addresses(&self) -> HashSet<SocketAddr>;

    /// Derive a sender for `pool`, or `None` when no usable route exists.
    fn create_sender(&self, pool: &PoolSnapshot) -> Option<Arc<dyn RpcSender>>;

    /// Type-erase this strategy for use inside a combinator.
    fn into_shared(self) -> Arc<dyn RpcStrategy>
    where
        Self: Sized + 'static,
    {
        Arc::new(self)
    }
}

impl<S: RpcStrategy + ?Sized> RpcStrategy for Arc<S> {
    fn addresses(&self) -> HashSet<SocketAddr> {
        (**self).addresses()
    }

    fn create_sender(&self, pool: &PoolSnapshot) -> Option<Arc<dyn RpcSender>> {
        (**self).create_sender(pool)
    }
}

fn union_addresses(strategies: &[Arc<dyn RpcStrategy>]) -> HashSet<SocketAddr> {
    strategies
        .iter()
        .flat_map(|strategy| strategy.addresses())
        .collect()
}
