//! Per-connection correlation state.
//!
//! Every request registered here leaves through exactly one of
//! [`CorrelationTable::take`], [`CorrelationTable::expire`] or
//! [`CorrelationTable::fail_all`]. Deadlines are kept in a min-heap so a
//! sweep only touches entries that actually expired; heap entries for
//! requests that already completed are dropped lazily when they reach the
//! head.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::time::Duration;

use tokio::time::Instant;

use super::sender::Callback;
use crate::error::{Result, RpcError};
use crate::protocol::{Response, TypeTag};

/// Longest wait a deadline represents; larger timeouts are clamped to it.
const MAX_WAIT: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// Instant `timeout` after `start`, saturating for timeouts such as
/// `Duration::MAX` that do not fit.
pub fn deadline_after(start: Instant, timeout: Duration) -> Instant {
    start + timeout.min(MAX_WAIT)
}

/// A request waiting for its response.
pub struct PendingRequest {
    pub response_tag: TypeTag,
    pub callback: Callback,
    pub timeout: Duration,
    pub deadline: Instant,
    pub created: Instant,
    /// Distinguishes reuses of the same correlation id.
    seq: u64,
}

impl PendingRequest {
    pub fn resolve(self, result: Result<Response>) {
        (self.callback)(result)
    }
}

/// Correlation ids, pending callbacks and the deadline queue of one connection.
#[derive(Default)]
pub struct CorrelationTable {
    last_id: u32,
    next_seq: u64,
    pending: HashMap<u32, PendingRequest>,
    deadlines: BinaryHeap<Reverse<(Instant, u64, u32)>>,
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn contains(&self, id: u32) -> bool {
        self.pending.contains_key(&id)
    }

    /// Next free id, wrapping on overflow and skipping ids still in flight.
    ///
    /// Id 0 is never handed out. Callers bound the table size well below
    /// `u32::MAX`, so a free id always exists.
    fn allocate_id(&mut self) -> u32 {
        loop {
            self.last_id = self.last_id.wrapping_add(1);
            if self.last_id != 0 && !self.pending.contains_key(&self.last_id) {
                return self.last_id;
            }
        }
    }

    /// Store a pending request and return its correlation id.
    ///
    /// The deadline counts from `sent_at`, the moment the caller submitted
    /// the request.
    pub fn register(
        &mut self,
        response_tag: TypeTag,
        timeout: Duration,
        sent_at: Instant,
        callback: Callback,
    ) -> u32 {
        let id = self.allocate_id();
        let seq = self.next_seq;
        self.next_seq += 1;
        let deadline = deadline_after(sent_at, timeout);

        self.deadlines.push(Reverse((deadline, seq, id)));
        self.pending.insert(
            id,
            PendingRequest {
                response_tag,
                callback,
                timeout,
                deadline,
                created: sent_at,
                seq,
            },
        );
        id
    }

    /// Remove the request with `id`, if it is still pending.
    pub fn take(&mut self, id: u32) -> Option<PendingRequest> {
        self.pending.remove(&id)
    }

    /// Earliest deadline of a request that is still pending.
    pub fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(Reverse((deadline, seq, id))) = self.deadlines.peek().copied() {
            if self.is_live(id, seq) {
                return Some(deadline);
            }
            self.deadlines.pop();
        }
        None
    }

    /// Fail every request whose deadline is at or before `now` with a timeout.
    ///
    /// Returns the number of requests that timed out.
    pub fn expire(&mut self, now: Instant) -> usize {
        let mut expired = 0;
        while let Some(Reverse((deadline, seq, id))) = self.deadlines.peek().copied() {
            if !self.is_live(id, seq) {
                self.deadlines.pop();
                continue;
            }
            if deadline > now {
                break;
            }
            self.deadlines.pop();
            if let Some(request) = self.pending.remove(&id) {
                let timeout = request.timeout;
                request.resolve(Err(RpcError::Timeout(timeout)));
                expired += 1;
            }
        }
        expired
    }

    /// Fail everything still pending and clear the table.
    pub fn fail_all(&mut self, error: RpcError) -> usize {
        self.deadlines.clear();
        let count = self.pending.len();
        for (_, request) in self.pending.drain() {
            request.resolve(Err(error.clone()));
        }
        count
    }

    fn is_live(&self, id: u32, seq: u64) -> bool {
        self.pending
            .get(&id)
            .is_some_and(|request| request.seq == seq)
    }
}
