use std::any::{Any, TypeId};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use super::RpcStrategy;
use crate::client::pool::PoolSnapshot;
use crate::client::sender::{Callback, RpcSender};
use crate::error::RpcError;
use crate::protocol::Request;

/// Routes by request type, with an optional fallback for unlisted types.
#[derive(Default)]
pub struct TypeDispatching {
    routes: HashMap<TypeId, Arc<dyn RpcStrategy>>,
    default: Option<Arc<dyn RpcStrategy>>,
}

pub fn type_dispatching() -> TypeDispatching {
    TypeDispatching::default()
}

impl TypeDispatching {
    /// Route requests of type `T` through `strategy`.
    pub fn on<T: Any>(mut self, strategy: Arc<dyn RpcStrategy>) -> Self {
        self.routes.insert(TypeId::of::<T>(), strategy);
        self
    }

    pub fn with_default(mut self, strategy: Arc<dyn RpcStrategy>) -> Self {
        self.default = Some(strategy);
        self
    }
}

impl RpcStrategy for TypeDispatching {
    fn addresses(&self) -> HashSet<SocketAddr> {
        self.routes
            .values()
            .chain(self.default.iter())
            .flat_map(|strategy| strategy.addresses())
            .collect()
    }

    fn create_sender(&self, pool: &PoolSnapshot) -> Option<Arc<dyn RpcSender>> {
        let routes: HashMap<_, _> = self
            .routes
            .iter()
            .filter_map(|(type_id, strategy)| {
                strategy.create_sender(pool).map(|sender| (*type_id, sender))
            })
            .collect();
        let default = self
            .default
            .as_ref()
            .and_then(|strategy| strategy.create_sender(pool));
        if routes.is_empty() && default.is_none() {
            return None;
        }
        Some(Arc::new(TypeDispatchSender { routes, default }))
    }
}

struct TypeDispatchSender {
    routes: HashMap<TypeId, Arc<dyn RpcSender>>,
    default: Option<Arc<dyn RpcSender>>,
}

impl RpcSender for TypeDispatchSender {
    fn send_request(&self, request: Request, timeout: Duration, callback: Callback) {
        match self.routes.get(&request.type_id()).or(self.default.as_ref()) {
            Some(sender) => sender.send_request(request, timeout, callback),
            None => callback(Err(RpcError::NoSenderAvailable)),
        }
    }
}
