use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::{json, Value};
use tower::ServiceExt;

use async_trait::async_trait;

use delivery_dispatch::api::rest::router;
use delivery_dispatch::dispatch::consumer::{run_dispatch_consumer, RetryPolicy};
use delivery_dispatch::dispatch::locator::{DriverLocator, DriverRegistry, LocatorError};
use delivery_dispatch::error::AppError;
use delivery_dispatch::geo::{estimate_minutes, haversine_km};
use delivery_dispatch::messaging::topology::{
    DISPATCH_DEAD_LETTER_QUEUE, DISPATCH_QUEUE, ORDER_EXCHANGE, ORDER_READY_KEY,
};
use delivery_dispatch::models::delivery::GeoPoint;
use delivery_dispatch::models::driver::{Driver, VehicleType};
use delivery_dispatch::relay::{run_location_reporter, LocationSource, LocationUpdate};
use delivery_dispatch::state::AppState;

fn test_state() -> Arc<AppState> {
    Arc::new(AppState::new(
        RetryPolicy::unbounded(Duration::from_millis(100)),
        64,
    ))
}

fn setup() -> (axum::Router, Arc<AppState>) {
    let state = test_state();
    (router(state.clone()), state)
}

fn setup_with_consumer() -> (axum::Router, Arc<AppState>) {
    let state = test_state();
    tokio::spawn(run_dispatch_consumer(state.clone()));
    (router(state.clone()), state)
}

fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_string(&body).unwrap()))
        .unwrap()
}

fn get_request(uri: &str) -> Request<Body> {
    Request::builder()
        .method("GET")
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

fn patch_request(uri: &str, body: Value) -> Request<Body> {
    json_request("PATCH", uri, body)
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

async fn body_string(response: axum::response::Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

fn dispatch_payload(order_id: &str) -> Value {
    json!({
        "orderId": order_id,
        "restaurantLocation": { "coordinates": [79.86, 6.92] },
        "deliveryLocation": { "coordinates": [79.90, 6.95] }
    })
}

async fn create_driver(app: &axum::Router, name: &str, vehicle: &str, lat: f64, lng: f64) -> Value {
    let response = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/drivers",
            json!({
                "name": name,
                "vehicle": vehicle,
                "location": { "lat": lat, "lng": lng }
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    body_json(response).await
}

#[tokio::test]
async fn health_returns_ok() {
    let (app, _state) = setup();
    let response = app.oneshot(get_request("/health")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["drivers"], 0);
    assert_eq!(body["deliveries"], 0);
    assert_eq!(body["active_deliveries"], 0);
}

#[tokio::test]
async fn metrics_returns_prometheus_format() {
    let (app, _state) = setup();
    let response = app.oneshot(get_request("/metrics")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);

    let content_type = response
        .headers()
        .get("content-type")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert!(content_type.contains("text/plain"));

    let body = body_string(response).await;
    assert!(body.contains("dispatch_queue_depth"));
}

#[tokio::test]
async fn create_driver_starts_available() {
    let (app, _state) = setup();
    let driver = create_driver(&app, "Nimal", "bike", 6.93, 79.87).await;

    assert_eq!(driver["name"], "Nimal");
    assert_eq!(driver["vehicle"], "bike");
    assert_eq!(driver["isAvailable"], true);
    assert!(!driver["id"].as_str().unwrap().is_empty());
}

#[tokio::test]
async fn create_driver_empty_name_returns_400() {
    let (app, _state) = setup();
    let response = app
        .oneshot(json_request(
            "POST",
            "/drivers",
            json!({
                "name": "  ",
                "vehicle": "car",
                "location": { "lat": 6.93, "lng": 79.87 }
            }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn unknown_vehicle_type_is_accepted() {
    let (app, _state) = setup();
    let driver = create_driver(&app, "Kasun", "hovercraft", 6.93, 79.87).await;
    assert_eq!(driver["vehicle"], "other");
}

#[tokio::test]
async fn update_driver_availability() {
    let (app, _state) = setup();
    let driver = create_driver(&app, "Ruwan", "scooter", 6.93, 79.87).await;
    let id = driver["id"].as_str().unwrap();

    let response = app
        .oneshot(patch_request(
            &format!("/drivers/{id}/availability"),
            json!({ "isAvailable": false }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["isAvailable"], false);
}

#[tokio::test]
async fn update_driver_location() {
    let (app, _state) = setup();
    let driver = create_driver(&app, "Chamari", "car", 6.93, 79.87).await;
    let id = driver["id"].as_str().unwrap();

    let response = app
        .oneshot(patch_request(
            &format!("/drivers/{id}/location"),
            json!({ "location": { "lat": 6.95, "lng": 79.91 } }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["location"]["lat"], 6.95);
    assert_eq!(body["location"]["lng"], 79.91);
}

#[tokio::test]
async fn get_nonexistent_delivery_returns_404() {
    let (app, _state) = setup();
    let fake_id = "00000000-0000-0000-0000-000000000000";
    let response = app
        .oneshot(get_request(&format!("/deliveries/{fake_id}")))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn publish_dispatch_is_accepted_and_queued() {
    let (app, state) = setup();

    let response = app
        .oneshot(json_request("POST", "/dispatches", dispatch_payload("O1")))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let body = body_json(response).await;
    assert_eq!(body["orderId"], "O1");
    assert_eq!(state.broker.depth(DISPATCH_QUEUE), 1);
}

#[tokio::test]
async fn full_dispatch_flow_assigns_nearest_bike_driver() {
    let (app, state) = setup_with_consumer();

    let driver = create_driver(&app, "Nimal", "bike", 6.93, 79.87).await;
    let driver_id = driver["id"].as_str().unwrap().to_string();

    let response = app
        .clone()
        .oneshot(json_request("POST", "/dispatches", dispatch_payload("O1")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    tokio::time::sleep(Duration::from_millis(200)).await;

    let response = app.clone().oneshot(get_request("/deliveries")).await.unwrap();
    let deliveries = body_json(response).await;
    let list = deliveries.as_array().unwrap();
    assert_eq!(list.len(), 1);

    let delivery = &list[0];
    assert_eq!(delivery["orderId"], "O1");
    assert_eq!(delivery["driverId"], driver_id);
    assert_eq!(delivery["status"], "assigned");
    assert!(delivery["currentLocation"].is_null());
    assert!(delivery["startedAt"].is_null());

    let pickup = GeoPoint { lat: 6.92, lng: 79.86 };
    let dropoff = GeoPoint { lat: 6.95, lng: 79.90 };
    let expected_eta = estimate_minutes(haversine_km(&pickup, &dropoff), VehicleType::Bike);
    assert_eq!(delivery["estimatedTime"], u64::from(expected_eta));

    let response = app.oneshot(get_request("/drivers")).await.unwrap();
    let drivers = body_json(response).await;
    assert_eq!(drivers.as_array().unwrap()[0]["isAvailable"], false);

    assert_eq!(state.broker.depth(DISPATCH_QUEUE), 0);
}

#[tokio::test]
async fn dispatch_waits_until_a_driver_becomes_available() {
    let (app, state) = setup_with_consumer();

    let response = app
        .clone()
        .oneshot(json_request("POST", "/dispatches", dispatch_payload("O2")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    tokio::time::sleep(Duration::from_millis(250)).await;
    assert!(state.store.find_by_order("O2").is_none());

    create_driver(&app, "Late Driver", "scooter", 6.93, 79.87).await;

    tokio::time::sleep(Duration::from_millis(400)).await;
    let delivery = state.store.find_by_order("O2").expect("order assigned");
    assert_eq!(delivery.order_id, "O2");
}

#[tokio::test]
async fn malformed_dispatch_is_discarded_not_retried() {
    let (_app, state) = setup_with_consumer();

    let poison = json!({
        "orderId": "O3",
        "restaurantLocation": { "coordinates": [79.86, 6.92] }
    });
    state
        .broker
        .publish(
            ORDER_EXCHANGE,
            ORDER_READY_KEY,
            &serde_json::to_vec(&poison).unwrap(),
            true,
        )
        .unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;

    assert!(state.store.find_by_order("O3").is_none());
    assert_eq!(state.broker.depth(DISPATCH_QUEUE), 0);
}

#[tokio::test]
async fn exhausted_retries_move_message_to_dead_letter_queue() {
    let state = Arc::new(AppState::new(
        RetryPolicy {
            requeue_delay: Duration::from_millis(50),
            max_attempts: Some(2),
        },
        64,
    ));
    tokio::spawn(run_dispatch_consumer(state.clone()));

    state
        .broker
        .publish(
            ORDER_EXCHANGE,
            ORDER_READY_KEY,
            &serde_json::to_vec(&dispatch_payload("O4")).unwrap(),
            true,
        )
        .unwrap();

    tokio::time::sleep(Duration::from_millis(500)).await;

    assert!(state.store.find_by_order("O4").is_none());
    assert_eq!(state.broker.depth(DISPATCH_DEAD_LETTER_QUEUE), 1);
    assert_eq!(state.broker.depth(DISPATCH_QUEUE), 0);
}

#[tokio::test]
async fn status_flow_releases_driver_on_delivery() {
    let (app, _state) = setup_with_consumer();

    create_driver(&app, "Nimal", "bike", 6.93, 79.87).await;
    app.clone()
        .oneshot(json_request("POST", "/dispatches", dispatch_payload("O5")))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let response = app.clone().oneshot(get_request("/deliveries")).await.unwrap();
    let deliveries = body_json(response).await;
    let delivery_id = deliveries[0]["id"].as_str().unwrap().to_string();

    let response = app
        .clone()
        .oneshot(patch_request(
            &format!("/deliveries/{delivery_id}/status"),
            json!({
                "status": "picked-up",
                "location": { "latitude": 6.921, "longitude": 79.861 }
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "picked-up");
    assert!(!body["startedAt"].is_null());
    assert_eq!(body["currentLocation"]["lat"], 6.921);

    app.clone()
        .oneshot(patch_request(
            &format!("/deliveries/{delivery_id}/status"),
            json!({ "status": "in-transit" }),
        ))
        .await
        .unwrap();

    let response = app
        .clone()
        .oneshot(patch_request(
            &format!("/deliveries/{delivery_id}/status"),
            json!({ "status": "delivered" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "delivered");
    assert!(!body["deliveredAt"].is_null());

    // the driver goes back into the pool once the delivery closes
    let response = app.oneshot(get_request("/drivers")).await.unwrap();
    let drivers = body_json(response).await;
    assert_eq!(drivers.as_array().unwrap()[0]["isAvailable"], true);
}

#[tokio::test]
async fn skipping_straight_to_delivered_is_rejected() {
    let (app, _state) = setup_with_consumer();

    create_driver(&app, "Nimal", "bike", 6.93, 79.87).await;
    app.clone()
        .oneshot(json_request("POST", "/dispatches", dispatch_payload("O6")))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let response = app.clone().oneshot(get_request("/deliveries")).await.unwrap();
    let deliveries = body_json(response).await;
    let delivery_id = deliveries[0]["id"].as_str().unwrap().to_string();

    let response = app
        .oneshot(patch_request(
            &format!("/deliveries/{delivery_id}/status"),
            json!({ "status": "delivered" }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn location_updates_persist_until_delivery_closes() {
    let (app, _state) = setup_with_consumer();

    create_driver(&app, "Nimal", "bike", 6.93, 79.87).await;
    app.clone()
        .oneshot(json_request("POST", "/dispatches", dispatch_payload("O7")))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let response = app.clone().oneshot(get_request("/deliveries")).await.unwrap();
    let deliveries = body_json(response).await;
    let delivery_id = deliveries[0]["id"].as_str().unwrap().to_string();

    let response = app
        .clone()
        .oneshot(patch_request(
            &format!("/deliveries/{delivery_id}/location"),
            json!({ "latitude": 6.93, "longitude": 79.88 }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["currentLocation"]["lat"], 6.93);
    assert_eq!(body["currentLocation"]["lng"], 79.88);

    app.clone()
        .oneshot(patch_request(
            &format!("/deliveries/{delivery_id}/status"),
            json!({ "status": "cancelled" }),
        ))
        .await
        .unwrap();

    let response = app
        .oneshot(patch_request(
            &format!("/deliveries/{delivery_id}/location"),
            json!({ "latitude": 6.94, "longitude": 79.89 }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn one_driver_serves_two_orders_in_sequence() {
    let (app, state) = setup_with_consumer();

    create_driver(&app, "Solo", "car", 6.93, 79.87).await;

    for order in ["O8", "O9"] {
        app.clone()
            .oneshot(json_request("POST", "/dispatches", dispatch_payload(order)))
            .await
            .unwrap();
    }

    tokio::time::sleep(Duration::from_millis(250)).await;

    // only one order can hold the single driver
    let first = state.store.find_by_order("O8").expect("first order assigned");
    assert!(state.store.find_by_order("O9").is_none());

    let response = app
        .clone()
        .oneshot(patch_request(
            &format!("/deliveries/{}/status", first.id),
            json!({ "status": "cancelled" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // the requeued order picks the driver up after the retry delay
    tokio::time::sleep(Duration::from_millis(400)).await;
    let second = state.store.find_by_order("O9").expect("second order assigned");
    assert_eq!(second.driver_id, first.driver_id);
}

struct FixedSource(LocationUpdate);

#[async_trait]
impl LocationSource for FixedSource {
    async fn sample(&self) -> Result<LocationUpdate, AppError> {
        Ok(self.0)
    }
}

#[tokio::test]
async fn location_reporter_feeds_room_until_delivery_closes() {
    let (app, state) = setup_with_consumer();

    create_driver(&app, "Nimal", "bike", 6.93, 79.87).await;
    app.clone()
        .oneshot(json_request("POST", "/dispatches", dispatch_payload("O10")))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let delivery = state.store.find_by_order("O10").expect("order assigned");
    let mut room_rx = state.rooms.subscribe(delivery.id);

    let source = Arc::new(FixedSource(LocationUpdate {
        latitude: 6.925,
        longitude: 79.875,
    }));
    let reporter = tokio::spawn(run_location_reporter(
        state.clone(),
        delivery.id,
        source,
        Duration::from_millis(50),
    ));

    let update = tokio::time::timeout(Duration::from_millis(500), room_rx.recv())
        .await
        .expect("room update within deadline")
        .unwrap();
    assert!((update.latitude - 6.925).abs() < 1e-9);

    let stored = state.store.get(delivery.id).unwrap();
    assert!(stored.current_location.is_some());

    state
        .store
        .transition(
            delivery.id,
            delivery_dispatch::models::delivery::DeliveryStatus::Cancelled,
            None,
        )
        .unwrap();

    // the reporter notices the terminal state and exits on its own
    tokio::time::timeout(Duration::from_millis(500), reporter)
        .await
        .expect("reporter stops after terminal transition")
        .unwrap();
}

struct FailingLocator;

#[async_trait]
impl DriverLocator for FailingLocator {
    async fn claim_nearest(&self, _pickup: &GeoPoint) -> Result<Option<Driver>, LocatorError> {
        Err(LocatorError::Unavailable("connection refused".to_string()))
    }

    async fn set_available(&self, _driver_id: uuid::Uuid, _available: bool) -> Result<(), LocatorError> {
        Ok(())
    }
}

#[tokio::test]
async fn locator_failure_is_retried_like_no_capacity() {
    let state = Arc::new(AppState::with_locator(
        RetryPolicy::unbounded(Duration::from_millis(50)),
        64,
        Arc::new(DriverRegistry::new()),
        Arc::new(FailingLocator),
    ));
    tokio::spawn(run_dispatch_consumer(state.clone()));

    state
        .broker
        .publish(
            ORDER_EXCHANGE,
            ORDER_READY_KEY,
            &serde_json::to_vec(&dispatch_payload("O11")).unwrap(),
            true,
        )
        .unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;

    assert!(state.store.find_by_order("O11").is_none());
    let requeued = state
        .metrics
        .dispatch_attempts_total
        .with_label_values(&["requeued"])
        .get();
    assert!(requeued >= 2, "expected repeated requeues, saw {requeued}");
}
