//! Fan-out to every sub-sender, answer with the first valid response.
//!
//! The caller's callback fires exactly once. Sub-calls that finish after the
//! answer was delivered still run to completion; their results are dropped.
//! When no sub-call produces a valid response the call fails: with the last
//! failure observed (by completion order) if any sub-call failed, otherwise
//! with the configured no-valid-result error.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use super::{union_addresses, RpcStrategy};
use crate::client::pool::PoolSnapshot;
use crate::client::sender::{Callback, RpcSender};
use crate::error::{Result, RpcError};
use crate::protocol::{Request, Response};

/// Verdict of a first-valid-result validator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Validity {
    Valid,
    Invalid,
}

impl From<bool> for Validity {
    fn from(valid: bool) -> Self {
        if valid {
            Validity::Valid
        } else {
            Validity::Invalid
        }
    }
}

type Validator = Arc<dyn Fn(&Response) -> Validity + Send + Sync>;

pub struct FirstValidResult {
    strategies: Vec<Arc<dyn RpcStrategy>>,
    validator: Validator,
    no_valid_result: RpcError,
    min_active: usize,
}

/// By default a response is valid unless it is absent.
///
/// Only pairs registered with
/// [`register_optional`](crate::protocol::RpcProtocolBuilder::register_optional)
/// produce absent responses, so unit-returning commands count as valid.
pub fn first_valid_result(strategies: Vec<Arc<dyn RpcStrategy>>) -> FirstValidResult {
    FirstValidResult {
        strategies,
        validator: Arc::new(|response: &Response| Validity::from(!response.is_absent())),
        no_valid_result: RpcError::no_valid_result(),
        min_active: 1,
    }
}

impl FirstValidResult {
    pub fn with_validator<F>(mut self, validator: F) -> Self
    where
        F: Fn(&Response) -> Validity + Send + Sync + 'static,
    {
        self.validator = Arc::new(validator);
        self
    }

    /// Error delivered when every sub-call answered but none validly.
    pub fn with_no_valid_result_error(mut self, error: RpcError) -> Self {
        self.no_valid_result = error;
        self
    }

    pub fn with_min_active(mut self, min_active: usize) -> Self {
        self.min_active = min_active.max(1);
        self
    }
}

impl RpcStrategy for FirstValidResult {
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
        Some(Arc::new(FirstValidSender {
            senders,
            validator: self.validator.clone(),
            no_valid_result: self.no_valid_result.clone(),
        }))
    }
}

struct FirstValidSender {
    senders: Vec<Arc<dyn RpcSender>>,
    validator: Validator,
    no_valid_result: RpcError,
}

impl RpcSender for FirstValidSender {
    fn send_request(&self, request: Request, timeout: Duration, callback: Callback) {
        let aggregator = Arc::new(Aggregator {
            state: Mutex::new(AggregatorState {
                callback: Some(callback),
                remaining: self.senders.len(),
                last_error: None,
            }),
            validator: self.validator.clone(),
            no_valid_result: self.no_valid_result.clone(),
        });

        for sender in &self.senders {
            let aggregator = aggregator.clone();
            sender.send_request(
                request.clone(),
                timeout,
                Box::new(move |result| aggregator.complete(result)),
            );
        }
    }
}

/// Per-call state shared by the sub-call callbacks.
struct Aggregator {
    state: Mutex<AggregatorState>,
    validator: Validator,
    no_valid_result: RpcError,
}

struct AggregatorState {
    /// Taken when the caller is answered.
    callback: Option<Callback>,
    remaining: usize,
    last_error: Option<RpcError>,
}

impl Aggregator {
    fn complete(&self, result: Result<Response>) {
        let valid = match &result {
            Ok(response) => (self.validator)(response) == Validity::Valid,
            Err(_) => false,
        };

        let delivery = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.remaining = state.remaining.saturating_sub(1);

            if valid {
                state.callback.take().map(|callback| (callback, result))
            } else {
                if let Err(err) = result {
                    state.last_error = Some(err);
                }
                if state.remaining == 0 {
                    let outcome = state
                        .last_error
                        .take()
                        .unwrap_or_else(|| self.no_valid_result.clone());
                    state.callback.take().map(|callback| (callback, Err(outcome)))
                } else {
                    None
                }
            }
        };

        if let Some((callback, result)) = delivery {
            callback(result);
        }
    }
}
