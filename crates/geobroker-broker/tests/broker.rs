//! Integration tests for geobroker-broker.
//!
//! These tests drive the broker end to end:
//! - Delegation to a real thread context
//! - Degraded mode and its equivalence with delegated mode
//! - Timeouts, late and out-of-order responses
//! - Context failure, shutdown and reinitialization

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::mpsc;

use geobroker_broker::{
    BrokerMode, ContextChannels, ContextEvent, ContextFactory, RegionBroker, ThreadContextFactory,
};
use geobroker_common::{BrokerConfig, BrokerError};
use geobroker_core::{
    DistanceUnit, FailureKind, Feature, GeoAdapter, Geometry, GeometryAdapter, LatLng, Operation,
    Position, RequestMessage, ResponseMessage,
};

// ============================================================================
// Helpers
// ============================================================================

fn feature(id: &str, name: &str, lng: (f64, f64), lat: (f64, f64)) -> Feature {
    serde_json::from_value(json!({
        "type": "Feature",
        "properties": { "ISO_A3": id, "name": name },
        "geometry": {
            "type": "Polygon",
            "coordinates": [[
                [lng.0, lat.0], [lng.1, lat.0], [lng.1, lat.1], [lng.0, lat.1], [lng.0, lat.0]
            ]]
        }
    }))
    .unwrap()
}

fn south_america() -> Vec<Feature> {
    vec![
        feature("ARG", "Argentina", (-73.0, -53.0), (-55.0, -22.0)),
        feature("BRA", "Brazil", (-74.0, -34.0), (-34.0, 5.0)),
    ]
}

fn brazil_only() -> Vec<Feature> {
    vec![serde_json::from_value(json!({
        "type": "Feature",
        "id": "BRA",
        "properties": {},
        "geometry": {
            "type": "Polygon",
            "coordinates": [[[-74, -34], [-34, -34], [-34, 5], [-74, 5], [-74, -34]]]
        }
    }))
    .unwrap()]
}

fn islands() -> Feature {
    serde_json::from_value(json!({
        "type": "Feature",
        "properties": { "ISO_A3": "ISL", "name": "Islands" },
        "geometry": {
            "type": "MultiPolygon",
            "coordinates": [
                [[[10, 10], [12, 10], [12, 12], [10, 12], [10, 10]]],
                [[[20, 20], [22, 20], [22, 22], [20, 22], [20, 20]]]
            ]
        }
    }))
    .unwrap()
}

fn square_ring(size: f64) -> Vec<Position> {
    vec![
        Position::new(0.0, 0.0),
        Position::new(size, 0.0),
        Position::new(size, size),
        Position::new(0.0, size),
        Position::new(0.0, 0.0),
    ]
}

fn degraded_config() -> BrokerConfig {
    let mut config = BrokerConfig::default();
    config.context.enabled = false;
    config
}

fn thread_broker() -> RegionBroker {
    RegionBroker::new(BrokerConfig::default())
}

/// Test ends of a context started by [`ManualFactory`].
struct ManualEnds {
    requests: mpsc::UnboundedReceiver<String>,
    events: mpsc::UnboundedSender<ContextEvent>,
}

impl ManualEnds {
    async fn next_request(&mut self) -> RequestMessage {
        let raw = self.requests.recv().await.unwrap();
        serde_json::from_str(&raw).unwrap()
    }

    fn respond(&self, response: &ResponseMessage) {
        self.events
            .send(ContextEvent::Response(
                serde_json::to_string(response).unwrap(),
            ))
            .unwrap();
    }
}

/// Context whose behaviour is scripted by the test.
#[derive(Default)]
struct ManualFactory {
    started: Mutex<Vec<ManualEnds>>,
}

impl ManualFactory {
    fn take(&self) -> ManualEnds {
        self.started.lock().remove(0)
    }
}

impl ContextFactory for ManualFactory {
    fn spawn(&self, _adapter: Arc<dyn GeometryAdapter>) -> Result<ContextChannels, BrokerError> {
        let (inbound, requests) = mpsc::unbounded_channel();
        let (events, outbound) = mpsc::unbounded_channel();
        self.started.lock().push(ManualEnds { requests, events });
        Ok(ContextChannels {
            inbound,
            outbound,
            thread: None,
        })
    }
}

fn manual_broker() -> (RegionBroker, Arc<ManualFactory>) {
    manual_broker_with(BrokerConfig::default())
}

fn manual_broker_with(config: BrokerConfig) -> (RegionBroker, Arc<ManualFactory>) {
    let factory = Arc::new(ManualFactory::default());
    let broker = RegionBroker::with_factory(
        config,
        Arc::new(GeoAdapter::new()),
        Arc::clone(&factory) as Arc<dyn ContextFactory>,
    );
    (broker, factory)
}

async fn eventually(condition: impl Fn() -> bool) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

// ============================================================================
// Test: Delegated Mode
// ============================================================================

#[tokio::test]
async fn test_delegated_point_in_polygon() {
    let broker = thread_broker();
    assert_eq!(broker.mode(), BrokerMode::Delegated);

    let inside = broker
        .point_in_polygon(LatLng::new(5.0, 5.0), vec![square_ring(10.0)])
        .await
        .unwrap();
    let outside = broker
        .point_in_polygon(LatLng::new(15.0, 5.0), vec![square_ring(10.0)])
        .await
        .unwrap();

    assert!(inside);
    assert!(!outside);

    let stats = broker.stats();
    assert_eq!(stats.delegated, 2);
    assert_eq!(stats.degraded, 0);
    assert_eq!(stats.in_flight, 0);
}

#[tokio::test]
async fn test_identify_brazil() {
    let broker = thread_broker();

    let sao_paulo = broker
        .identify_region(LatLng::new(-23.55, -46.63), brazil_only())
        .await
        .unwrap();
    assert!(sao_paulo.matched);
    assert_eq!(sao_paulo.region_id.as_deref(), Some("BRA"));
    assert_eq!(sao_paulo.region_name.as_deref(), Some("Unknown"));

    let null_island = broker
        .identify_region(LatLng::new(0.0, 0.0), brazil_only())
        .await
        .unwrap();
    assert!(!null_island.matched);
    assert!(null_island.region_id.is_none());
}

#[tokio::test]
async fn test_first_match_wins_on_overlap() {
    let broker = thread_broker();
    let features = vec![
        feature("AAA", "First", (0.0, 10.0), (0.0, 10.0)),
        feature("BBB", "Second", (5.0, 15.0), (5.0, 15.0)),
    ];

    let found = broker
        .identify_region(LatLng::new(7.0, 7.0), features.clone())
        .await
        .unwrap();
    assert_eq!(found.region_id.as_deref(), Some("AAA"));

    let reversed: Vec<Feature> = features.into_iter().rev().collect();
    let found = broker
        .identify_region(LatLng::new(7.0, 7.0), reversed)
        .await
        .unwrap();
    assert_eq!(found.region_id.as_deref(), Some("BBB"));
}

#[tokio::test]
async fn test_region_index_lookup() {
    let broker = thread_broker();

    let count = broker
        .load_index("south-america", south_america())
        .await
        .unwrap();
    assert_eq!(count, 2);
    assert_eq!(broker.index_names(), vec!["south-america".to_string()]);

    let found = broker
        .identify_in_index(LatLng::new(-34.6, -58.4), "south-america")
        .await
        .unwrap();
    assert_eq!(found.region_id.as_deref(), Some("ARG"));

    assert_eq!(broker.clear_index(Some("south-america")).await.unwrap(), 1);
    let err = broker
        .identify_in_index(LatLng::new(-34.6, -58.4), "south-america")
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::OperationError { ref message } if message.contains("south-america")));
}

#[tokio::test]
async fn test_malformed_ring_is_operation_error() {
    let broker = thread_broker();
    let ring = vec![
        Position::new(0.0, 0.0),
        Position::new(1.0, 0.0),
        Position::new(0.0, 0.0),
    ];

    let err = broker
        .point_in_polygon(LatLng::new(0.5, 0.5), vec![ring])
        .await
        .unwrap_err();

    assert!(matches!(err, BrokerError::OperationError { .. }));
    assert_eq!(broker.mode(), BrokerMode::Delegated);
}

// ============================================================================
// Test: Degraded Mode
// ============================================================================

#[tokio::test]
async fn test_disabled_context_runs_degraded() {
    let broker = RegionBroker::new(degraded_config());
    assert_eq!(broker.mode(), BrokerMode::Degraded);

    let found = broker
        .identify_region(LatLng::new(-23.55, -46.63), south_america())
        .await
        .unwrap();
    assert_eq!(found.region_id.as_deref(), Some("BRA"));

    let stats = broker.stats();
    assert_eq!(stats.degraded, 1);
    assert_eq!(stats.delegated, 0);
}

#[tokio::test]
async fn test_degraded_matches_delegated() {
    let delegated = thread_broker();
    let degraded = RegionBroker::new(degraded_config());
    let polygon = Geometry::Polygon(vec![square_ring(4.0)]);
    let paris = LatLng::new(48.8566, 2.3522);
    let london = LatLng::new(51.5074, -0.1278);

    for unit in [DistanceUnit::Kilometers, DistanceUnit::Miles] {
        assert_eq!(
            delegated.distance(paris, london, unit).await.unwrap(),
            degraded.distance(paris, london, unit).await.unwrap()
        );
    }
    assert_eq!(
        delegated.bbox(polygon.clone()).await.unwrap(),
        degraded.bbox(polygon.clone()).await.unwrap()
    );
    assert_eq!(
        delegated.centroid(polygon.clone()).await.unwrap(),
        degraded.centroid(polygon).await.unwrap()
    );
    let mut world = south_america();
    world.push(islands());
    for broker in [&delegated, &degraded] {
        assert_eq!(broker.load_index("world", world.clone()).await.unwrap(), 3);
    }
    for point in [
        LatLng::new(-23.55, -46.63),
        LatLng::new(21.0, 21.0),
        LatLng::new(0.0, 0.0),
    ] {
        let expected = degraded.identify_region(point, world.clone()).await.unwrap();
        assert_eq!(
            delegated.identify_region(point, world.clone()).await.unwrap(),
            expected
        );
        assert_eq!(
            delegated.identify_in_index(point, "world").await.unwrap(),
            expected
        );
        assert_eq!(
            degraded.identify_in_index(point, "world").await.unwrap(),
            expected
        );
    }
    let second_island = degraded
        .identify_in_index(LatLng::new(21.0, 21.0), "world")
        .await
        .unwrap();
    assert_eq!(second_island.region_id.as_deref(), Some("ISL"));

    let bad = LatLng::new(120.0, 0.0);
    assert_eq!(
        delegated
            .point_in_polygon(bad, vec![square_ring(1.0)])
            .await
            .unwrap_err(),
        degraded
            .point_in_polygon(bad, vec![square_ring(1.0)])
            .await
            .unwrap_err()
    );
}

#[tokio::test]
async fn test_index_survives_shutdown() {
    let broker = thread_broker();
    broker.load_index("sa", south_america()).await.unwrap();

    let sao_paulo = LatLng::new(-23.55, -46.63);
    let delegated = broker.identify_in_index(sao_paulo, "sa").await.unwrap();
    assert_eq!(delegated.region_id.as_deref(), Some("BRA"));

    broker.shutdown();
    let inline = broker.identify_in_index(sao_paulo, "sa").await.unwrap();

    assert_eq!(inline, delegated);
    assert_eq!(broker.stats().degraded, 1);
}

#[tokio::test]
async fn test_index_survives_context_error() {
    let (broker, factory) = manual_broker();
    let mut ends = factory.take();
    let features = serde_json::to_value(south_america()).unwrap();

    let responder = async {
        let request = ends.next_request().await;
        assert_eq!(request.operation, "LoadRegionIndex");
        ends.respond(&ResponseMessage::success(
            request.correlation_id,
            json!({ "name": "sa", "count": 2 }),
        ));
    };
    let (loaded, ()) = tokio::join!(
        broker.invoke(
            Operation::LoadRegionIndex,
            json!({ "name": "sa", "features": features })
        ),
        responder
    );
    assert_eq!(loaded.unwrap()["count"], json!(2));

    ends.events
        .send(ContextEvent::Error("crashed".to_string()))
        .unwrap();
    eventually(|| broker.mode() == BrokerMode::Degraded).await;

    let found = broker
        .identify_in_index(LatLng::new(-34.6, -58.4), "sa")
        .await
        .unwrap();
    assert_eq!(found.region_id.as_deref(), Some("ARG"));
    assert_eq!(broker.stats().degraded_reason.as_deref(), Some("crashed"));
}

#[tokio::test]
async fn test_rejected_load_is_not_mirrored() {
    let (broker, factory) = manual_broker();
    let mut ends = factory.take();

    let responder = async {
        let request = ends.next_request().await;
        ends.respond(&ResponseMessage::failure(
            request.correlation_id,
            FailureKind::Operation,
            "index too large",
        ));
    };
    let (result, ()) = tokio::join!(broker.load_index("sa", south_america()), responder);

    assert!(matches!(result, Err(BrokerError::OperationError { .. })));
    assert!(broker.index_names().is_empty());
}

#[test]
fn test_without_runtime_runs_degraded() {
    let broker = RegionBroker::new(BrokerConfig::default());
    assert_eq!(broker.mode(), BrokerMode::Degraded);

    let km = tokio_test::block_on(broker.distance(
        LatLng::new(0.0, 0.0),
        LatLng::new(0.0, 1.0),
        DistanceUnit::Kilometers,
    ))
    .unwrap();
    assert!((km - 111.2).abs() < 0.5);
}

// ============================================================================
// Test: Correlation and Timeouts
// ============================================================================

#[tokio::test]
async fn test_out_of_order_responses() {
    let (broker, factory) = manual_broker();
    let mut ends = factory.take();

    let responder = async {
        let first = ends.next_request().await;
        let second = ends.next_request().await;
        ends.respond(&ResponseMessage::success(second.correlation_id, json!("second")));
        ends.respond(&ResponseMessage::success(first.correlation_id, json!("first")));
    };

    let (a, b, ()) = tokio::join!(
        broker.invoke(Operation::Distance, json!({})),
        broker.invoke(Operation::Centroid, json!({})),
        responder
    );

    assert_eq!(a.unwrap(), json!("first"));
    assert_eq!(b.unwrap(), json!("second"));
}

#[tokio::test]
async fn test_timeout_then_late_response_discarded() {
    let (broker, factory) = manual_broker();
    let mut ends = factory.take();

    let err = broker
        .invoke_with_timeout(
            Operation::PointInPolygon,
            json!({}),
            Duration::from_millis(50),
        )
        .await
        .unwrap_err();
    assert_eq!(err, BrokerError::timeout("PointInPolygon", 50));
    assert!(err.is_timeout());
    assert_eq!(broker.stats().in_flight, 0);

    let request = ends.next_request().await;
    ends.respond(&ResponseMessage::success(request.correlation_id, json!(true)));
    eventually(|| broker.stats().late_discarded == 1).await;

    // A timeout is local; the context keeps serving.
    assert_eq!(broker.mode(), BrokerMode::Delegated);
    assert_eq!(broker.stats().timed_out, 1);
}

#[tokio::test]
async fn test_dropped_caller_abandons_request() {
    let mut config = BrokerConfig::default();
    config.timeouts.point_ms = 50;
    let (broker, factory) = manual_broker_with(config);
    let mut ends = factory.take();

    let outer = tokio::time::timeout(
        Duration::from_millis(10),
        broker.invoke(Operation::Distance, json!({})),
    )
    .await;
    assert!(outer.is_err());

    let stats = broker.stats();
    assert_eq!(stats.in_flight, 0);
    assert_eq!(stats.abandoned, 1);
    assert_eq!(stats.timed_out, 0);

    let request = ends.next_request().await;
    ends.respond(&ResponseMessage::success(request.correlation_id, json!(1.0)));
    eventually(|| broker.stats().late_discarded == 1).await;
    assert_eq!(broker.mode(), BrokerMode::Delegated);
}

#[tokio::test]
async fn test_unknown_operation_reported() {
    let (broker, factory) = manual_broker();
    let mut ends = factory.take();

    let responder = async {
        let request = ends.next_request().await;
        ends.respond(&ResponseMessage::failure(
            request.correlation_id,
            FailureKind::UnknownOperation,
            "unknown operation: simplify",
        ));
    };

    let (result, ()) = tokio::join!(broker.invoke(Operation::Distance, json!({})), responder);
    assert_eq!(
        result.unwrap_err(),
        BrokerError::UnknownOperation {
            operation: "simplify".to_string()
        }
    );
}

// ============================================================================
// Test: Context Failure
// ============================================================================

#[tokio::test]
async fn test_context_error_fails_in_flight_requests() {
    let (broker, factory) = manual_broker();
    let mut ends = factory.take();

    let failer = async {
        ends.next_request().await;
        ends.next_request().await;
        ends.events
            .send(ContextEvent::Error("out of memory".to_string()))
            .unwrap();
    };

    let (a, b, ()) = tokio::join!(
        broker.invoke(Operation::Distance, json!({})),
        broker.invoke(Operation::BoundingBox, json!({})),
        failer
    );

    for result in [a, b] {
        let err = result.unwrap_err();
        assert!(err.is_context_failure(), "unexpected error: {err}");
    }
    assert_eq!(broker.mode(), BrokerMode::Degraded);

    let km = broker
        .distance(
            LatLng::new(0.0, 0.0),
            LatLng::new(0.0, 0.0),
            DistanceUnit::Kilometers,
        )
        .await
        .unwrap();
    assert_eq!(km, 0.0);
    assert_eq!(broker.stats().degraded, 1);
}

#[tokio::test]
async fn test_context_exit_fails_in_flight_requests() {
    let (broker, factory) = manual_broker();
    let mut ends = factory.take();

    let exiter = async move {
        ends.next_request().await;
        drop(ends);
    };

    let (result, ()) = tokio::join!(broker.invoke(Operation::Centroid, json!({})), exiter);
    assert!(result.unwrap_err().is_context_failure());
    assert_eq!(broker.mode(), BrokerMode::Degraded);
}

// ============================================================================
// Test: Shutdown
// ============================================================================

#[tokio::test]
async fn test_shutdown_cancels_in_flight_requests() {
    let (broker, _factory) = manual_broker();

    let stopper = async {
        eventually(|| broker.stats().in_flight == 1).await;
        broker.shutdown();
    };

    let (result, ()) = tokio::join!(broker.invoke(Operation::Distance, json!({})), stopper);
    assert_eq!(result.unwrap_err(), BrokerError::Cancelled);
    assert_eq!(broker.mode(), BrokerMode::Stopped);

    broker.shutdown();
    assert_eq!(broker.mode(), BrokerMode::Stopped);

    let inside = broker
        .point_in_polygon(LatLng::new(1.0, 1.0), vec![square_ring(2.0)])
        .await
        .unwrap();
    assert!(inside);
}

// ============================================================================
// Test: Reinitialization
// ============================================================================

#[tokio::test]
async fn test_reinitialize_replays_region_indexes() {
    let broker = RegionBroker::with_factory(
        degraded_config(),
        Arc::new(GeoAdapter::new()),
        Arc::new(ThreadContextFactory::new("reinit-context")),
    );
    broker.load_index("sa", south_america()).await.unwrap();
    assert_eq!(broker.stats().degraded, 1);

    broker.reinitialize().await.unwrap();
    assert_eq!(broker.mode(), BrokerMode::Delegated);

    let found = broker
        .identify_in_index(LatLng::new(-23.55, -46.63), "sa")
        .await
        .unwrap();
    assert_eq!(found.region_id.as_deref(), Some("BRA"));
    assert_eq!(broker.stats().delegated, 2);
}

#[tokio::test]
async fn test_reinitialize_after_context_failure() {
    let (broker, factory) = manual_broker();
    let first = factory.take();
    first
        .events
        .send(ContextEvent::Error("crashed".to_string()))
        .unwrap();
    eventually(|| broker.mode() == BrokerMode::Degraded).await;

    broker.reinitialize().await.unwrap();
    assert_eq!(broker.mode(), BrokerMode::Delegated);

    let mut second = factory.take();
    let responder = async {
        let request = second.next_request().await;
        assert_eq!(request.operation, "Distance");
        second.respond(&ResponseMessage::success(request.correlation_id, json!(42.0)));
    };
    let (result, ()) = tokio::join!(broker.invoke(Operation::Distance, json!({})), responder);
    assert_eq!(result.unwrap(), json!(42.0));

    // Events from the failed context no longer reach the broker.
    drop(first);
    tokio::task::yield_now().await;
    assert_eq!(broker.mode(), BrokerMode::Delegated);
}

#[tokio::test]
async fn test_reinitialize_fails_when_restore_fails() {
    let (broker, factory) = manual_broker();
    let mut first = factory.take();

    let responder = async {
        let request = first.next_request().await;
        first.respond(&ResponseMessage::success(
            request.correlation_id,
            json!({ "name": "sa", "count": 2 }),
        ));
    };
    let (loaded, ()) = tokio::join!(broker.load_index("sa", south_america()), responder);
    assert_eq!(loaded.unwrap(), 2);

    first
        .events
        .send(ContextEvent::Error("crashed".to_string()))
        .unwrap();
    eventually(|| broker.mode() == BrokerMode::Degraded).await;

    let restorer = async {
        eventually(|| !factory.started.lock().is_empty()).await;
        let mut second = factory.take();
        // The restore is the first thing the new context sees.
        let request = second.next_request().await;
        assert_eq!(request.operation, "LoadRegionIndex");
        assert_eq!(request.payload["name"], json!("sa"));
        second.respond(&ResponseMessage::failure(
            request.correlation_id,
            FailureKind::Operation,
            "out of memory",
        ));
        second
    };
    let (result, _second) = tokio::join!(broker.reinitialize(), restorer);

    let err = result.unwrap_err();
    assert!(err.is_context_failure(), "unexpected error: {err}");
    let stats = broker.stats();
    assert_eq!(stats.mode, BrokerMode::Degraded);
    assert_eq!(stats.in_flight, 0);
    assert!(stats.degraded_reason.unwrap().contains("'sa'"));

    let found = broker
        .identify_in_index(LatLng::new(-23.55, -46.63), "sa")
        .await
        .unwrap();
    assert_eq!(found.region_id.as_deref(), Some("BRA"));
}

#[tokio::test]
async fn test_reinitialize_waits_for_restore() {
    let (broker, factory) = manual_broker();
    broker.shutdown();
    factory.take();
    broker.load_index("sa", south_america()).await.unwrap();

    let restorer = async {
        eventually(|| !factory.started.lock().is_empty()).await;
        let mut ends = factory.take();
        let request = ends.next_request().await;
        assert_eq!(request.operation, "LoadRegionIndex");
        ends.respond(&ResponseMessage::success(
            request.correlation_id,
            json!({ "name": "sa", "count": 2 }),
        ));
        ends
    };
    let (result, _ends) = tokio::join!(broker.reinitialize(), restorer);

    result.unwrap();
    assert_eq!(broker.mode(), BrokerMode::Delegated);
    assert_eq!(broker.stats().in_flight, 0);
}

#[tokio::test]
async fn test_reinitialize_is_noop_when_running() {
    let broker = thread_broker();
    broker.reinitialize().await.unwrap();
    assert_eq!(broker.mode(), BrokerMode::Delegated);

    let km: Value = broker
        .invoke(
            Operation::Distance,
            json!({"from": [0.0, 0.0], "to": [0.0, 0.0]}),
        )
        .await
        .unwrap();
    assert_eq!(km, json!(0.0));
}
