//! In-flight request table.
//!
//! Maps each live correlation id to the continuation awaiting it. Every
//! terminal path (response, timeout, context failure, shutdown) settles an
//! entry by removing it from the map first; only the path that wins the
//! removal delivers an outcome, so no request is ever settled twice.

use std::time::Instant;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::debug;

use geobroker_common::BrokerError;
use geobroker_core::{CorrelationId, Operation};

/// Outcome delivered to a waiting caller.
pub type Outcome = Result<Value, BrokerError>;

struct PendingEntry {
    operation: Operation,
    submitted_at: Instant,
    reply: oneshot::Sender<Outcome>,
}

/// Concurrent correlation id -> continuation map.
#[derive(Default)]
pub struct PendingTable {
    entries: DashMap<CorrelationId, PendingEntry>,
}

impl PendingTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a request and return the receiver its outcome arrives on.
    pub fn register(
        &self,
        correlation_id: CorrelationId,
        operation: Operation,
    ) -> oneshot::Receiver<Outcome> {
        let (reply, receiver) = oneshot::channel();
        let previous = self.entries.insert(
            correlation_id,
            PendingEntry {
                operation,
                submitted_at: Instant::now(),
                reply,
            },
        );
        debug_assert!(previous.is_none(), "correlation id reused while live");
        receiver
    }

    /// Settle a request with `outcome`.
    ///
    /// Returns `false` if the request was already settled.
    pub fn resolve(&self, correlation_id: CorrelationId, outcome: Outcome) -> bool {
        let Some((_, entry)) = self.entries.remove(&correlation_id) else {
            return false;
        };
        debug!(
            correlation_id,
            operation = %entry.operation,
            elapsed_ms = entry.submitted_at.elapsed().as_millis(),
            ok = outcome.is_ok(),
            "Request settled"
        );
        // The caller may have stopped waiting; nothing to do then.
        let _ = entry.reply.send(outcome);
        true
    }

    /// Remove a request without delivering anything.
    ///
    /// Used by the waiting caller itself when its window expires. Returns
    /// `false` if another path settled the request first.
    pub fn abandon(&self, correlation_id: CorrelationId) -> bool {
        self.entries.remove(&correlation_id).is_some()
    }

    /// Settle every live request with `error`. Returns how many were settled.
    pub fn fail_all(&self, error: &BrokerError) -> usize {
        let ids: Vec<CorrelationId> = self.entries.iter().map(|e| *e.key()).collect();
        ids.into_iter()
            .filter(|id| self.resolve(*id, Err(error.clone())))
            .count()
    }

    /// Number of live requests.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if nothing is in flight.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl std::fmt::Debug for PendingTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingTable")
            .field("in_flight", &self.entries.len())
            .finish()
    }
}
