//! Request broker.
//!
//! [`RegionBroker`] presents one asynchronous operation surface whether or
//! not an execution context is usable:
//!
//! - **Delegated mode**: the request is serialized, tagged with a fresh
//!   correlation id, and sent to the execution context. A dispatcher task
//!   drains the context's events and settles the matching pending entry.
//! - **Degraded mode**: no context is running (disabled, failed to start,
//!   failed later, or shut down). The same request envelope is handled
//!   inline on the caller's task. Large scans block the caller here.
//!
//! A context-level failure rejects every in-flight request with
//! [`BrokerError::ContextFailure`] and leaves the broker degraded until the
//! owner calls [`RegionBroker::reinitialize`].

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::runtime::Handle;
use tokio::sync::mpsc::{self, error::SendError};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use geobroker_common::{BrokerConfig, BrokerError};
use geobroker_core::protocol::{
    ClearRegionIndexPayload, DistancePayload, GeometryPayload, IdentifyRegionPayload,
    LoadRegionIndexPayload, PointInMultiPolygonPayload, PointInPolygonPayload,
};
use geobroker_core::{
    BoundingBox, CorrelationId, DistanceUnit, Feature, GeoAdapter, Geometry, GeometryAdapter,
    LatLng, LoadedIndex, MessageHandler, MultiPolygonCoords, Operation, PolygonCoords,
    RegionMatch, RequestMessage, ResponseMessage,
};

use crate::context::{ContextEvent, ContextFactory, ThreadContextFactory};
use crate::pending::{Outcome, PendingTable};

/// How the broker is currently serving requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerMode {
    /// Requests go to the execution context.
    Delegated,
    /// Requests run inline on the caller's task.
    Degraded,
    /// The broker was shut down; requests run inline.
    Stopped,
}

/// Snapshot of broker activity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerStats {
    /// Current mode.
    pub mode: BrokerMode,
    /// Requests awaiting a response.
    pub in_flight: usize,
    /// Requests handed to an execution context.
    pub delegated: u64,
    /// Requests handled inline.
    pub degraded: u64,
    /// Requests abandoned after their window expired.
    pub timed_out: u64,
    /// Requests abandoned because the caller stopped waiting.
    pub abandoned: u64,
    /// Responses discarded because their request was already settled.
    pub late_discarded: u64,
    /// Why no execution context is running, when degraded.
    pub degraded_reason: Option<String>,
}

#[derive(Debug, Default)]
struct Counters {
    delegated: AtomicU64,
    degraded: AtomicU64,
    timed_out: AtomicU64,
    abandoned: AtomicU64,
    late_discarded: AtomicU64,
    generation: AtomicU64,
}

enum ContextState {
    Running(RunningContext),
    Unavailable { reason: String },
    Stopped,
}

struct RunningContext {
    generation: u64,
    inbound: mpsc::UnboundedSender<String>,
    dispatcher: JoinHandle<()>,
    // Detached on drop; the thread exits once `inbound` is dropped.
    _thread: Option<thread::JoinHandle<()>>,
}

enum Submission {
    Sent(oneshot::Receiver<Outcome>),
    Degraded(String),
}

struct Dispatched {
    outcome: Outcome,
    reached_context: bool,
}

impl Dispatched {
    /// Whether an index change must also be applied to the inline handler.
    ///
    /// Everything the context did not explicitly reject is mirrored.
    fn mirrors(&self) -> bool {
        self.reached_context
            && !matches!(
                self.outcome,
                Err(BrokerError::OperationError { .. } | BrokerError::UnknownOperation { .. })
            )
    }
}

/// Region index loads queued into a fresh context.
struct Replay {
    generation: u64,
    loads: Vec<ReplayLoad>,
}

struct ReplayLoad {
    correlation_id: CorrelationId,
    name: String,
    reply: oneshot::Receiver<Outcome>,
}

#[derive(Serialize)]
struct LoadRequest<'a> {
    name: &'a str,
    features: &'a [Feature],
}

/// Abandons a delegated request whose caller stops waiting before it
/// settles.
struct InFlight<'a> {
    broker: &'a RegionBroker,
    correlation_id: CorrelationId,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if self.broker.pending.abandon(self.correlation_id) {
            self.broker.counters.abandoned.fetch_add(1, Ordering::Relaxed);
            debug!(
                broker_id = %self.broker.id,
                correlation_id = self.correlation_id,
                "Caller stopped waiting; request abandoned"
            );
        }
    }
}

/// Broker between callers and a geometry execution context.
///
/// # Example
///
/// ```ignore
/// use geobroker_broker::RegionBroker;
/// use geobroker_common::BrokerConfig;
/// use geobroker_core::LatLng;
///
/// let broker = RegionBroker::new(BrokerConfig::default());
/// broker.load_index("countries", countries).await?;
///
/// let found = broker
///     .identify_in_index(LatLng::new(-23.55, -46.63), "countries")
///     .await?;
/// assert_eq!(found.region_id.as_deref(), Some("BRA"));
///
/// broker.shutdown();
/// ```
pub struct RegionBroker {
    id: Uuid,
    config: BrokerConfig,
    adapter: Arc<dyn GeometryAdapter>,
    factory: Arc<dyn ContextFactory>,
    next_id: AtomicU64,
    pending: Arc<PendingTable>,
    context: Arc<Mutex<ContextState>>,
    fallback: Mutex<MessageHandler>,
    counters: Arc<Counters>,
}

impl RegionBroker {
    /// Create a broker backed by the `geo` adapter and a thread context.
    ///
    /// Must be called from within a Tokio runtime for the execution context
    /// to start; otherwise the broker runs in degraded mode.
    pub fn new(config: BrokerConfig) -> Self {
        let factory = Arc::new(ThreadContextFactory::from_config(&config.context));
        Self::with_factory(config, Arc::new(GeoAdapter::new()), factory)
    }

    /// Create a broker with a custom adapter and context strategy.
    pub fn with_factory(
        config: BrokerConfig,
        adapter: Arc<dyn GeometryAdapter>,
        factory: Arc<dyn ContextFactory>,
    ) -> Self {
        let broker = Self {
            id: Uuid::new_v4(),
            fallback: Mutex::new(MessageHandler::new(Arc::clone(&adapter))),
            config,
            adapter,
            factory,
            next_id: AtomicU64::new(1),
            pending: Arc::new(PendingTable::new()),
            context: Arc::new(Mutex::new(ContextState::Unavailable {
                reason: "not started".to_string(),
            })),
            counters: Arc::new(Counters::default()),
        };

        if broker.config.context.enabled {
            if let Err(err) = broker.start_context() {
                broker.mark_unavailable(err.to_string());
            }
        } else {
            broker.mark_unavailable("disabled by configuration".to_string());
        }

        broker
    }

    /// Unique identifier of this broker (for log correlation).
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Broker configuration.
    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Current serving mode.
    pub fn mode(&self) -> BrokerMode {
        self.state_summary().0
    }

    /// Activity snapshot.
    pub fn stats(&self) -> BrokerStats {
        let (mode, degraded_reason) = self.state_summary();
        BrokerStats {
            mode,
            in_flight: self.pending.len(),
            delegated: self.counters.delegated.load(Ordering::Relaxed),
            degraded: self.counters.degraded.load(Ordering::Relaxed),
            timed_out: self.counters.timed_out.load(Ordering::Relaxed),
            abandoned: self.counters.abandoned.load(Ordering::Relaxed),
            late_discarded: self.counters.late_discarded.load(Ordering::Relaxed),
            degraded_reason,
        }
    }

    fn state_summary(&self) -> (BrokerMode, Option<String>) {
        match &*self.context.lock() {
            ContextState::Running(_) => (BrokerMode::Delegated, None),
            ContextState::Unavailable { reason } => (BrokerMode::Degraded, Some(reason.clone())),
            ContextState::Stopped => (BrokerMode::Stopped, None),
        }
    }

    /// Response window for `operation`.
    pub fn timeout_for(&self, operation: Operation) -> Duration {
        if operation.is_collection_scan() {
            self.config.timeouts.scan()
        } else {
            self.config.timeouts.point()
        }
    }

    /// Run `operation` with the configured response window.
    pub async fn invoke(&self, operation: Operation, payload: Value) -> Result<Value, BrokerError> {
        let window = self.timeout_for(operation);
        self.invoke_with_timeout(operation, payload, window).await
    }

    /// Run `operation`, waiting at most `window` for a delegated response.
    ///
    /// Degraded mode ignores `window`; the computation runs to completion
    /// on the caller's task. Dropping the returned future before it
    /// completes abandons the request.
    pub async fn invoke_with_timeout(
        &self,
        operation: Operation,
        payload: Value,
        window: Duration,
    ) -> Result<Value, BrokerError> {
        let mirror = operation_mutates_index(operation).then(|| payload.clone());
        let dispatched = self.dispatch(operation, payload, window).await;
        if let Some(payload) = mirror
            && dispatched.mirrors()
        {
            self.mirror_index_change(operation, &payload);
        }
        dispatched.outcome
    }

    /// Test whether `point` lies inside a polygon.
    pub async fn point_in_polygon(
        &self,
        point: LatLng,
        polygon: PolygonCoords,
    ) -> Result<bool, BrokerError> {
        self.call(
            Operation::PointInPolygon,
            &PointInPolygonPayload { point, polygon },
        )
        .await
    }

    /// Test whether `point` lies inside any polygon of a multipolygon.
    pub async fn point_in_multi_polygon(
        &self,
        point: LatLng,
        multi_polygon: MultiPolygonCoords,
    ) -> Result<bool, BrokerError> {
        self.call(
            Operation::PointInMultiPolygon,
            &PointInMultiPolygonPayload {
                point,
                multi_polygon,
            },
        )
        .await
    }

    /// Find the first of `features`, in order, containing `point`.
    pub async fn identify_region(
        &self,
        point: LatLng,
        features: Vec<Feature>,
    ) -> Result<RegionMatch, BrokerError> {
        self.call(
            Operation::IdentifyRegion,
            &IdentifyRegionPayload {
                point,
                features: Some(features),
                index: None,
            },
        )
        .await
    }

    /// Find the first feature of a loaded region index containing `point`.
    pub async fn identify_in_index(
        &self,
        point: LatLng,
        index: &str,
    ) -> Result<RegionMatch, BrokerError> {
        self.call(
            Operation::IdentifyRegion,
            &IdentifyRegionPayload {
                point,
                features: None,
                index: Some(index.to_string()),
            },
        )
        .await
    }

    /// Great-circle distance between two points.
    pub async fn distance(
        &self,
        from: LatLng,
        to: LatLng,
        unit: DistanceUnit,
    ) -> Result<f64, BrokerError> {
        self.call(Operation::Distance, &DistancePayload { from, to, unit })
            .await
    }

    /// Bounding box of a geometry.
    pub async fn bbox(&self, geometry: Geometry) -> Result<BoundingBox, BrokerError> {
        self.call(Operation::BoundingBox, &GeometryPayload { geometry })
            .await
    }

    /// Centroid of a geometry.
    pub async fn centroid(&self, geometry: Geometry) -> Result<LatLng, BrokerError> {
        self.call(Operation::Centroid, &GeometryPayload { geometry })
            .await
    }

    /// Store `features` under `name` for later [`Self::identify_in_index`].
    ///
    /// Re-loading a name replaces its contents. Returns the feature count.
    pub async fn load_index(
        &self,
        name: impl Into<String>,
        features: Vec<Feature>,
    ) -> Result<usize, BrokerError> {
        let name = name.into();
        let features: Arc<[Feature]> = features.into();
        let payload = encode_payload(&LoadRequest {
            name: &name,
            features: &features,
        })?;

        let operation = Operation::LoadRegionIndex;
        let dispatched = self
            .dispatch(operation, payload, self.timeout_for(operation))
            .await;
        // Keep the inline index in step so degraded lookups still find
        // datasets loaded while delegated.
        if dispatched.mirrors() {
            self.fallback.lock().index_mut().load(name, features);
        }

        let loaded: LoadedIndex = decode_result(dispatched.outcome?)?;
        Ok(loaded.count)
    }

    /// Drop one region index, or all of them. Returns how many were dropped.
    pub async fn clear_index(&self, name: Option<&str>) -> Result<usize, BrokerError> {
        let payload = encode_payload(&ClearRegionIndexPayload {
            name: name.map(str::to_string),
        })?;

        let operation = Operation::ClearRegionIndex;
        let dispatched = self
            .dispatch(operation, payload, self.timeout_for(operation))
            .await;
        if dispatched.mirrors() {
            self.fallback.lock().index_mut().clear(name);
        }

        let cleared = dispatched.outcome?;
        Ok(cleared["cleared"]
            .as_u64()
            .and_then(|n| usize::try_from(n).ok())
            .unwrap_or(0))
    }

    /// Names of the region indexes currently loaded.
    pub fn index_names(&self) -> Vec<String> {
        self.fallback.lock().index().names()
    }

    /// Start a fresh execution context after a failure or shutdown.
    ///
    /// Region indexes loaded so far are restored into the new context before
    /// any other request reaches it. If restoring one fails, the new context
    /// is torn down and the broker stays degraded. Does nothing if a context
    /// is already running.
    pub async fn reinitialize(&self) -> Result<(), BrokerError> {
        if matches!(*self.context.lock(), ContextState::Running(_)) {
            return Ok(());
        }

        let Replay { generation, loads } = match self.start_context() {
            Ok(replay) => replay,
            Err(err) => {
                self.mark_unavailable(err.to_string());
                return Err(err);
            }
        };

        let _in_flight: Vec<InFlight<'_>> = loads
            .iter()
            .map(|load| InFlight {
                broker: self,
                correlation_id: load.correlation_id,
            })
            .collect();
        let window = self.timeout_for(Operation::LoadRegionIndex);

        for load in loads {
            debug!(broker_id = %self.id, name = %load.name, "Awaiting region index restore");
            let outcome = self
                .await_reply(load.correlation_id, Operation::LoadRegionIndex, load.reply, window)
                .await;
            if let Err(err) = outcome {
                let reason = format!("failed to restore region index '{}': {err}", load.name);
                fail_context(&mut self.context.lock(), generation, &self.pending, &reason);
                return Err(BrokerError::context_failure(reason));
            }
        }

        Ok(())
    }

    /// Terminate the execution context and cancel everything in flight.
    ///
    /// Safe to call more than once. Later invocations run in degraded mode.
    pub fn shutdown(&self) {
        let previous = std::mem::replace(&mut *self.context.lock(), ContextState::Stopped);
        if let ContextState::Running(running) = previous {
            running.dispatcher.abort();
            info!(
                broker_id = %self.id,
                generation = running.generation,
                "Execution context terminated"
            );
        }

        let cancelled = self.pending.fail_all(&BrokerError::Cancelled);
        if cancelled > 0 {
            info!(broker_id = %self.id, cancelled, "Cancelled in-flight requests");
        }
    }

    async fn call<P, R>(&self, operation: Operation, payload: &P) -> Result<R, BrokerError>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        let result = self.invoke(operation, encode_payload(payload)?).await?;
        decode_result(result)
    }

    #[instrument(skip_all, fields(broker_id = %self.id, operation = %operation))]
    async fn dispatch(&self, operation: Operation, payload: Value, window: Duration) -> Dispatched {
        let correlation_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = RequestMessage::new(correlation_id, operation, payload);
        let envelope = match serde_json::to_string(&request) {
            Ok(envelope) => envelope,
            Err(e) => {
                return Dispatched {
                    outcome: Err(BrokerError::operation(format!(
                        "failed to encode request: {e}"
                    ))),
                    reached_context: false,
                };
            }
        };

        match self.submit(correlation_id, operation, envelope) {
            Submission::Sent(reply) => {
                let _in_flight = InFlight {
                    broker: self,
                    correlation_id,
                };
                Dispatched {
                    outcome: self
                        .await_reply(correlation_id, operation, reply, window)
                        .await,
                    reached_context: true,
                }
            }
            Submission::Degraded(envelope) => Dispatched {
                outcome: self.run_degraded(correlation_id, operation, &envelope),
                reached_context: false,
            },
        }
    }

    async fn await_reply(
        &self,
        correlation_id: CorrelationId,
        operation: Operation,
        mut reply: oneshot::Receiver<Outcome>,
        window: Duration,
    ) -> Outcome {
        match tokio::time::timeout(window, &mut reply).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(BrokerError::Cancelled),
            Err(_) => {
                if self.pending.abandon(correlation_id) {
                    self.counters.timed_out.fetch_add(1, Ordering::Relaxed);
                    let duration_ms = u64::try_from(window.as_millis()).unwrap_or(u64::MAX);
                    warn!(correlation_id, duration_ms, "Request timed out");
                    Err(BrokerError::timeout(operation.as_str(), duration_ms))
                } else {
                    // Settled concurrently with the deadline.
                    reply.await.unwrap_or(Err(BrokerError::Cancelled))
                }
            }
        }
    }

    /// Apply a delegated index change from a raw payload to the inline handler.
    fn mirror_index_change(&self, operation: Operation, payload: &Value) {
        let mut fallback = self.fallback.lock();
        let applied = match operation {
            Operation::LoadRegionIndex => {
                LoadRegionIndexPayload::deserialize(payload).map(|p| {
                    fallback.index_mut().load(p.name, p.features);
                })
            }
            Operation::ClearRegionIndex => {
                ClearRegionIndexPayload::deserialize(payload).map(|p| {
                    fallback.index_mut().clear(p.name.as_deref());
                })
            }
            _ => Ok(()),
        };
        if let Err(e) = applied {
            warn!(
                broker_id = %self.id,
                %operation,
                error = %e,
                "Region index change not mirrored; degraded lookups may differ"
            );
        }
    }

    fn submit(
        &self,
        correlation_id: CorrelationId,
        operation: Operation,
        envelope: String,
    ) -> Submission {
        let mut state = self.context.lock();
        let ContextState::Running(running) = &*state else {
            return Submission::Degraded(envelope);
        };

        // Registered under the state lock: a concurrent context failure
        // either sees this entry or happens before it and sends us inline.
        let reply = self.pending.register(correlation_id, operation);
        let generation = running.generation;

        match running.inbound.send(envelope) {
            Ok(()) => {
                self.counters.delegated.fetch_add(1, Ordering::Relaxed);
                Submission::Sent(reply)
            }
            Err(SendError(envelope)) => {
                self.pending.abandon(correlation_id);
                fail_context(
                    &mut state,
                    generation,
                    &self.pending,
                    "execution context is no longer accepting requests",
                );
                Submission::Degraded(envelope)
            }
        }
    }

    fn run_degraded(
        &self,
        correlation_id: CorrelationId,
        operation: Operation,
        envelope: &str,
    ) -> Result<Value, BrokerError> {
        self.counters.degraded.fetch_add(1, Ordering::Relaxed);
        debug!(correlation_id, %operation, "Handling request inline (degraded mode)");

        let raw = self
            .fallback
            .lock()
            .handle_raw(envelope)
            .map_err(|e| BrokerError::operation(e.to_string()))?;
        let response: ResponseMessage =
            serde_json::from_str(&raw).map_err(|e| BrokerError::operation(e.to_string()))?;
        response.into_outcome()
    }

    fn start_context(&self) -> Result<Replay, BrokerError> {
        let runtime = Handle::try_current()
            .map_err(|e| BrokerError::context_failure(format!("no async runtime: {e}")))?;

        let mut state = self.context.lock();
        let channels = self.factory.spawn(Arc::clone(&self.adapter))?;
        let generation = self.counters.generation.fetch_add(1, Ordering::Relaxed) + 1;

        // Queued before the context becomes visible, so every caller request
        // reaches it after the indexes are restored.
        let mut loads = Vec::new();
        if let Err(err) = self.queue_replay(&channels.inbound, &mut loads) {
            for load in &loads {
                self.pending.abandon(load.correlation_id);
            }
            return Err(err);
        }

        let link = DispatchLink {
            broker_id: self.id,
            generation,
            pending: Arc::clone(&self.pending),
            context: Arc::clone(&self.context),
            counters: Arc::clone(&self.counters),
        };
        let dispatcher = runtime.spawn(dispatch_events(link, channels.outbound));

        *state = ContextState::Running(RunningContext {
            generation,
            inbound: channels.inbound,
            dispatcher,
            _thread: channels.thread,
        });

        info!(
            broker_id = %self.id,
            generation,
            restoring = loads.len(),
            "Execution context started"
        );
        Ok(Replay { generation, loads })
    }

    fn queue_replay(
        &self,
        inbound: &mpsc::UnboundedSender<String>,
        loads: &mut Vec<ReplayLoad>,
    ) -> Result<(), BrokerError> {
        let fallback = self.fallback.lock();
        for (name, features) in fallback.index().iter() {
            let payload = encode_payload(&LoadRequest {
                name,
                features: &features[..],
            })?;
            let correlation_id = self.next_id.fetch_add(1, Ordering::Relaxed);
            let request = RequestMessage::new(correlation_id, Operation::LoadRegionIndex, payload);
            let envelope = serde_json::to_string(&request)
                .map_err(|e| BrokerError::operation(format!("failed to encode request: {e}")))?;

            let reply = self.pending.register(correlation_id, Operation::LoadRegionIndex);
            loads.push(ReplayLoad {
                correlation_id,
                name: name.to_string(),
                reply,
            });
            inbound.send(envelope).map_err(|_| {
                BrokerError::context_failure("execution context exited before its indexes were restored")
            })?;
            self.counters.delegated.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    fn mark_unavailable(&self, reason: String) {
        warn!(broker_id = %self.id, reason = %reason, "Execution context unavailable; running in degraded mode");
        *self.context.lock() = ContextState::Unavailable { reason };
    }
}

impl Drop for RegionBroker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for RegionBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (mode, degraded_reason) = self.state_summary();
        f.debug_struct("RegionBroker")
            .field("id", &self.id)
            .field("mode", &mode)
            .field("degraded_reason", &degraded_reason)
            .field("in_flight", &self.pending.len())
            .finish_non_exhaustive()
    }
}

fn encode_payload<P: Serialize>(payload: &P) -> Result<Value, BrokerError> {
    serde_json::to_value(payload)
        .map_err(|e| BrokerError::operation(format!("failed to encode payload: {e}")))
}

fn decode_result<R: DeserializeOwned>(result: Value) -> Result<R, BrokerError> {
    serde_json::from_value(result)
        .map_err(|e| BrokerError::operation(format!("unexpected result shape: {e}")))
}

fn operation_mutates_index(operation: Operation) -> bool {
    matches!(
        operation,
        Operation::LoadRegionIndex | Operation::ClearRegionIndex
    )
}

/// Mark `generation` failed and reject everything in flight.
///
/// A no-op unless `generation` is the running context, so a stale
/// dispatcher or a shutdown broker is never affected.
fn fail_context(
    state: &mut ContextState,
    generation: u64,
    pending: &PendingTable,
    reason: &str,
) -> bool {
    match state {
        ContextState::Running(running) if running.generation == generation => {}
        _ => return false,
    }

    *state = ContextState::Unavailable {
        reason: reason.to_string(),
    };
    let failed = pending.fail_all(&BrokerError::context_failure(reason));
    warn!(
        generation,
        failed,
        reason,
        "Execution context failed; switching to degraded mode"
    );
    true
}

struct DispatchLink {
    broker_id: Uuid,
    generation: u64,
    pending: Arc<PendingTable>,
    context: Arc<Mutex<ContextState>>,
    counters: Arc<Counters>,
}

impl DispatchLink {
    fn deliver(&self, raw: &str) {
        let response: ResponseMessage = match serde_json::from_str(raw) {
            Ok(response) => response,
            Err(e) => {
                warn!(broker_id = %self.broker_id, error = %e, "Discarding undecodable response");
                return;
            }
        };

        let correlation_id = response.correlation_id;
        if !self.pending.resolve(correlation_id, response.into_outcome()) {
            self.counters.late_discarded.fetch_add(1, Ordering::Relaxed);
            debug!(
                broker_id = %self.broker_id,
                correlation_id,
                "Discarding response for settled request"
            );
        }
    }

    fn fail(&self, reason: &str) {
        fail_context(
            &mut self.context.lock(),
            self.generation,
            &self.pending,
            reason,
        );
    }
}

async fn dispatch_events(link: DispatchLink, mut outbound: mpsc::UnboundedReceiver<ContextEvent>) {
    while let Some(event) = outbound.recv().await {
        match event {
            ContextEvent::Response(raw) => link.deliver(&raw),
            ContextEvent::Error(reason) => {
                link.fail(&reason);
                return;
            }
        }
    }
    link.fail("execution context exited");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_selection() {
        let broker = RegionBroker::with_factory(
            BrokerConfig::default(),
            Arc::new(GeoAdapter::new()),
            Arc::new(ThreadContextFactory::new("unused")),
        );

        assert_eq!(
            broker.timeout_for(Operation::IdentifyRegion),
            Duration::from_secs(10)
        );
        assert_eq!(
            broker.timeout_for(Operation::PointInPolygon),
            Duration::from_secs(5)
        );
    }

    #[test]
    fn test_no_runtime_means_degraded() {
        let broker = RegionBroker::new(BrokerConfig::default());
        let stats = broker.stats();

        assert_eq!(stats.mode, BrokerMode::Degraded);
        assert!(stats.degraded_reason.unwrap().contains("no async runtime"));
    }

    #[test]
    fn test_disabled_context_reason() {
        let mut config = BrokerConfig::default();
        config.context.enabled = false;
        let broker = RegionBroker::new(config);

        assert_eq!(
            broker.stats().degraded_reason.as_deref(),
            Some("disabled by configuration")
        );
        assert!(format!("{broker:?}").contains("disabled by configuration"));
    }

    #[test]
    fn test_mirror_only_what_the_context_accepted() {
        let dispatched = |outcome, reached_context| Dispatched {
            outcome,
            reached_context,
        };

        assert!(dispatched(Ok(Value::Null), true).mirrors());
        assert!(dispatched(Err(BrokerError::timeout("LoadRegionIndex", 5)), true).mirrors());
        assert!(!dispatched(Ok(Value::Null), false).mirrors());
        assert!(!dispatched(Err(BrokerError::operation("bad payload")), true).mirrors());
        assert!(!dispatched(Err(BrokerError::unknown_operation("Load")), true).mirrors());
    }

    #[test]
    fn test_index_mutation_classification() {
        assert!(operation_mutates_index(Operation::LoadRegionIndex));
        assert!(operation_mutates_index(Operation::ClearRegionIndex));
        assert!(!operation_mutates_index(Operation::IdentifyRegion));
    }
}
