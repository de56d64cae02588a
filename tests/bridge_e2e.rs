//! End to end tests running the full bridge against a live device simulator:
//! REST requests through the router, background channel exchanges over TCP,
//! and webhook fan-out to a local notification sink.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::State;
use axum::http::{Request, StatusCode};
use axum::routing::post;
use axum::{Json, Router};
use http_body_util::BodyExt;
use serde_json::Value;
use tokio::sync::mpsc;
use tower::ServiceExt;

use imaging_bridge::api::{build_router, ApiResponse, AppState, MessageType};
use imaging_bridge::channel::ChannelClient;
use imaging_bridge::config::StorageConfig;
use imaging_bridge::metadata::{ImagingMetadata, MetadataSlot, SettingsCatalog};
use imaging_bridge::notify::{ClientRegistration, NotificationRegistry};
use imaging_bridge::simulator::{DeviceSimulator, SimulatorConfig};
use imaging_bridge::trigger::TriggerRegistry;

/// A local HTTP endpoint that records every JSON body POSTed to it.
async fn spawn_sink() -> (String, mpsc::UnboundedReceiver<Value>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let app = Router::new()
        .route(
            "/hook",
            post(|State(tx): State<mpsc::UnboundedSender<Value>>, Json(body): Json<Value>| async move {
                let _ = tx.send(body);
                StatusCode::OK
            }),
        )
        .with_state(tx);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind sink");
    let addr = listener.local_addr().expect("sink addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("sink server");
    });
    (format!("http://{addr}/hook"), rx)
}

async fn bridge_with_simulator(
    simulator: SimulatorConfig,
    channel_timeout: Duration,
) -> AppState {
    let (endpoint, _handle) = DeviceSimulator::spawn(simulator).await.expect("simulator");
    AppState {
        channel: Arc::new(ChannelClient::new(endpoint, channel_timeout)),
        triggers: Arc::new(TriggerRegistry::new(64)),
        notifications: Arc::new(
            NotificationRegistry::new(Duration::from_millis(500), StorageConfig::default())
                .expect("registry"),
        ),
        metadata: Arc::new(MetadataSlot::new()),
        catalog: Arc::new(SettingsCatalog::new(vec!["default".into()])),
    }
}

async fn call(router: &Router, request: Request<Body>) -> ApiResponse {
    let response = router.clone().oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("body")
        .to_bytes();
    serde_json::from_slice(&bytes).expect("envelope")
}

fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .method("GET")
        .uri(uri)
        .body(Body::empty())
        .expect("request")
}

fn put_empty(uri: &str) -> Request<Body> {
    Request::builder()
        .method("PUT")
        .uri(uri)
        .body(Body::empty())
        .expect("request")
}

fn post_metadata(plant: &str) -> Request<Body> {
    let metadata = ImagingMetadata {
        plant_id: plant.into(),
        experiment_id: "EXP-42".into(),
        treatment_id: "DROUGHT".into(),
        height: 120.5,
        angle: 45.0,
    };
    Request::builder()
        .method("POST")
        .uri("/metadata")
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_vec(&metadata).expect("json")))
        .expect("request")
}

async fn poll_until(router: &Router, trigger_id: &str, wanted: &str) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let envelope = call(router, get(&format!("/status/{trigger_id}"))).await;
        if envelope.message.message_text == wanted {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "trigger {trigger_id} stuck in '{}', wanted '{wanted}'",
            envelope.message.message_text
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn test_full_flow_with_webhook_notification() {
    let state = bridge_with_simulator(SimulatorConfig::reliable(), Duration::from_secs(2)).await;
    let router = build_router(state.clone());

    let (sink_uri, mut rx) = spawn_sink().await;
    state
        .notifications
        .register(ClientRegistration {
            client_name: "greenhouse".into(),
            uri: sink_uri,
            send_path_info: true,
            send_data: false,
            heart_beat_interval: 0,
        })
        .expect("register");

    call(&router, post_metadata("PLANT-007")).await;
    let envelope = call(&router, put_empty("/trigger/PLANT-007")).await;
    assert_eq!(envelope.message.message_type, MessageType::Success);
    let trigger_id = envelope.values[0].clone();

    poll_until(&router, &trigger_id, "finished").await;

    let envelope = call(&router, get(&format!("/getimageid/{trigger_id}"))).await;
    assert_eq!(envelope.message.message_type, MessageType::Success);
    let image_id = envelope.values[0].clone();
    assert!(image_id.starts_with("PLANT-007_ImageSet_"));

    let payload = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("notification delivered")
        .expect("sink open");
    assert_eq!(payload["Type"], "ImageAcquisition");
    assert_eq!(payload["TriggerId"], trigger_id.as_str());
    assert_eq!(payload["PlantId"], "PLANT-007");
    assert_eq!(payload["Status"], "success");
    assert_eq!(payload["ImageId"], image_id.as_str());
    assert!(payload["ImagePath"]
        .as_str()
        .expect("path string")
        .starts_with("imaging/images/"));
}

#[tokio::test]
async fn test_unreachable_webhook_does_not_affect_trigger() {
    let state = bridge_with_simulator(SimulatorConfig::reliable(), Duration::from_secs(2)).await;
    let router = build_router(state.clone());

    let (sink_uri, mut rx) = spawn_sink().await;
    state
        .notifications
        .register(ClientRegistration {
            client_name: "dead".into(),
            uri: "http://127.0.0.1:1/hook".into(),
            send_path_info: true,
            send_data: false,
            heart_beat_interval: 0,
        })
        .expect("register dead");
    state
        .notifications
        .register(ClientRegistration {
            client_name: "alive".into(),
            uri: sink_uri,
            send_path_info: true,
            send_data: false,
            heart_beat_interval: 0,
        })
        .expect("register alive");

    call(&router, post_metadata("PLANT-001")).await;
    let envelope = call(&router, put_empty("/trigger/PLANT-001")).await;
    let trigger_id = envelope.values[0].clone();

    poll_until(&router, &trigger_id, "finished").await;

    // The healthy client still gets its notification.
    let payload = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("notification delivered")
        .expect("sink open");
    assert_eq!(payload["TriggerId"], trigger_id.as_str());

    // The dead client's failure is counted but changed nothing above.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    while state.notifications.delivery_failures() == 0 {
        assert!(
            tokio::time::Instant::now() < deadline,
            "failure never counted"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn test_channel_timeout_marks_trigger_error() {
    let slow = SimulatorConfig {
        error_rate: 0.0,
        delay_min: Duration::from_secs(5),
        delay_max: Duration::from_secs(5),
    };
    let state = bridge_with_simulator(slow, Duration::from_millis(200)).await;
    let router = build_router(state.clone());

    call(&router, post_metadata("PLANT-001")).await;
    let envelope = call(&router, put_empty("/trigger/PLANT-001")).await;
    let trigger_id = envelope.values[0].clone();

    poll_until(&router, &trigger_id, "error").await;

    let envelope = call(&router, get(&format!("/getimageid/{trigger_id}"))).await;
    assert_eq!(envelope.message.message_type, MessageType::Error);
}

#[tokio::test]
async fn test_sequential_triggers_keep_distinct_image_ids() {
    let state = bridge_with_simulator(SimulatorConfig::reliable(), Duration::from_secs(2)).await;
    let router = build_router(state.clone());

    let plants = ["PLANT-A", "PLANT-B", "PLANT-C"];
    let mut trigger_ids = Vec::new();
    for plant in plants {
        call(&router, post_metadata(plant)).await;
        let envelope = call(&router, put_empty(&format!("/trigger/{plant}"))).await;
        assert_eq!(envelope.message.message_type, MessageType::Success);
        let trigger_id = envelope.values[0].clone();
        poll_until(&router, &trigger_id, "finished").await;
        trigger_ids.push((plant, trigger_id));
    }

    // Each trigger's image id carries its own plant, never a neighbor's.
    for (plant, trigger_id) in &trigger_ids {
        let envelope = call(&router, get(&format!("/getimageid/{trigger_id}"))).await;
        assert_eq!(envelope.message.message_type, MessageType::Success);
        assert!(envelope.values[0].starts_with(&format!("{plant}_ImageSet_")));
    }
}

#[tokio::test]
async fn test_status_reports_busy_during_exchange() {
    let slow = SimulatorConfig {
        error_rate: 0.0,
        delay_min: Duration::from_millis(300),
        delay_max: Duration::from_millis(300),
    };
    let state = bridge_with_simulator(slow, Duration::from_secs(2)).await;
    let router = build_router(state.clone());

    call(&router, post_metadata("PLANT-001")).await;
    let envelope = call(&router, put_empty("/trigger/PLANT-001")).await;
    let trigger_id = envelope.values[0].clone();

    let envelope = call(&router, get("/status")).await;
    assert_eq!(envelope.message.message_text, "busy");
    assert_eq!(envelope.values, vec![trigger_id.clone()]);

    poll_until(&router, &trigger_id, "finished").await;

    let envelope = call(&router, get("/status")).await;
    assert_eq!(envelope.message.message_text, "idle");
}
