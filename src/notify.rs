//! Notification registry and webhook dispatcher.
//!
//! Clients register a webhook URI to receive two event kinds: image-ready
//! events after a trigger completes, and periodic heartbeats. Each
//! registration owns its heartbeat task; the task is cancelled exactly when
//! the registration is removed or replaced, so no orphaned timers survive.
//!
//! Delivery is isolated both ways: image-ready fan-out spawns one task per
//! client so a slow or unreachable endpoint cannot delay the others or the
//! trigger path, and every delivery runs under the webhook timeout. Failures
//! are logged and counted, never propagated to the trigger caller.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::config::StorageConfig;
use crate::error::{BridgeError, BridgeResult};
use crate::trigger::{TriggerRecord, TriggerState};

/// Minimum heartbeat period. Registrations asking for less are clamped.
const HEARTBEAT_FLOOR: Duration = Duration::from_secs(1);

/// Information required to register for notifications upon imaging events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientRegistration {
    /// Name to identify a registered client
    #[serde(rename = "ClientName")]
    pub client_name: String,
    /// Uri where notifications should be sent
    #[serde(rename = "Uri")]
    pub uri: String,
    /// Whether to include the image storage path in notifications
    #[serde(rename = "SendPathInfo")]
    pub send_path_info: bool,
    /// Whether to include the image data as a binary blob
    #[serde(rename = "SendData")]
    pub send_data: bool,
    /// Heartbeat interval in ms (0 = no heartbeat)
    #[serde(rename = "HeartBeatInterval")]
    pub heart_beat_interval: u64,
}

/// Thin wrapper over `reqwest::Client` with the delivery timeout baked in at
/// construction.
#[derive(Clone)]
pub struct WebhookClient {
    client: reqwest::Client,
}

impl WebhookClient {
    /// Build a client with the per-delivery timeout baked in.
    ///
    /// # Errors
    ///
    /// `Configuration` if the underlying HTTP client cannot be constructed;
    /// a client without the timeout would break delivery isolation, so there
    /// is no fallback.
    pub fn new(timeout: Duration) -> BridgeResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| {
                BridgeError::Configuration(format!("webhook HTTP client construction: {e}"))
            })?;
        Ok(Self { client })
    }

    /// POST a JSON payload to a client URI.
    pub async fn send_notification(
        &self,
        uri: &str,
        payload: &serde_json::Value,
    ) -> BridgeResult<()> {
        let response = self
            .client
            .post(uri)
            .json(payload)
            .send()
            .await
            .map_err(|e| BridgeError::WebhookDelivery(e.to_string()))?;

        if !response.status().is_success() {
            return Err(BridgeError::WebhookDelivery(format!(
                "{} answered {}",
                uri,
                response.status()
            )));
        }
        Ok(())
    }

    /// POST a liveness payload to a client URI.
    pub async fn send_heartbeat(&self, uri: &str) -> BridgeResult<()> {
        let payload = json!({
            "Type": "Heartbeat",
            "Timestamp": Utc::now().to_rfc3339(),
            "Status": "alive",
        });
        self.send_notification(uri, &payload).await
    }
}

struct Registered {
    data: ClientRegistration,
    heartbeat: Option<JoinHandle<()>>,
}

/// Registry of webhook subscriptions plus the image-ready dispatcher.
pub struct NotificationRegistry {
    webhook: Arc<WebhookClient>,
    storage: StorageConfig,
    clients: Mutex<HashMap<String, Registered>>,
    delivery_failures: Arc<AtomicU64>,
}

impl NotificationRegistry {
    pub fn new(webhook_timeout: Duration, storage: StorageConfig) -> BridgeResult<Self> {
        Ok(Self {
            webhook: Arc::new(WebhookClient::new(webhook_timeout)?),
            storage,
            clients: Mutex::new(HashMap::new()),
            delivery_failures: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Upsert a subscription. A re-registration under the same name replaces
    /// the prior one atomically, cancelling its heartbeat before the new one
    /// (if any) starts.
    ///
    /// # Errors
    ///
    /// `InvalidRegistration` for an empty name, empty URI, or a URI without
    /// scheme and host.
    pub fn register(&self, registration: ClientRegistration) -> BridgeResult<()> {
        if registration.client_name.is_empty() {
            return Err(BridgeError::InvalidRegistration(
                "client name is required".to_string(),
            ));
        }
        if registration.uri.is_empty() {
            return Err(BridgeError::InvalidRegistration(
                "URI is required".to_string(),
            ));
        }
        let parsed = Url::parse(&registration.uri).map_err(|e| {
            BridgeError::InvalidRegistration(format!("invalid URI '{}': {e}", registration.uri))
        })?;
        if !parsed.has_host() {
            return Err(BridgeError::InvalidRegistration(format!(
                "URI '{}' has no host",
                registration.uri
            )));
        }

        // The old heartbeat must stop before the replacement starts, and
        // both must happen under the lock so no moment has two timers for
        // the same name.
        let mut clients = self.clients.lock().unwrap_or_else(|e| e.into_inner());
        let replaced = match clients.remove(&registration.client_name) {
            Some(previous) => {
                if let Some(task) = previous.heartbeat {
                    task.abort();
                }
                true
            }
            None => false,
        };

        let heartbeat = (registration.heart_beat_interval > 0).then(|| {
            self.spawn_heartbeat(
                registration.client_name.clone(),
                registration.uri.clone(),
                Duration::from_millis(registration.heart_beat_interval).max(HEARTBEAT_FLOOR),
            )
        });

        if replaced {
            info!(client = %registration.client_name, "Replaced existing registration");
        } else {
            info!(client = %registration.client_name, uri = %registration.uri, "Client registered");
        }
        clients.insert(
            registration.client_name.clone(),
            Registered {
                data: registration,
                heartbeat,
            },
        );
        Ok(())
    }

    /// Remove a subscription and cancel its heartbeat.
    ///
    /// # Errors
    ///
    /// `ClientNotRegistered` when the name is unknown; other clients are
    /// untouched either way.
    pub fn unregister(&self, client_name: &str) -> BridgeResult<()> {
        let mut clients = self.clients.lock().unwrap_or_else(|e| e.into_inner());
        match clients.remove(client_name) {
            Some(registered) => {
                if let Some(task) = registered.heartbeat {
                    task.abort();
                }
                info!(client = %client_name, "Client unregistered");
                Ok(())
            }
            None => {
                warn!(client = %client_name, "Unregister for unknown client");
                Err(BridgeError::ClientNotRegistered(client_name.to_string()))
            }
        }
    }

    /// Names of currently registered clients.
    pub fn registered_names(&self) -> Vec<String> {
        let clients = self.clients.lock().unwrap_or_else(|e| e.into_inner());
        clients.keys().cloned().collect()
    }

    /// Total failed image-ready deliveries since startup. Heartbeat failures
    /// are logged only; they are routine for an offline client.
    pub fn delivery_failures(&self) -> u64 {
        self.delivery_failures.load(Ordering::Relaxed)
    }

    /// Fan an image-ready event out to every registered client.
    ///
    /// Each delivery runs in its own task with its own timeout; this method
    /// returns as soon as the tasks are spawned so the trigger path is never
    /// delayed by a slow client.
    pub fn notify_image_ready(&self, record: &TriggerRecord) {
        let snapshot: Vec<ClientRegistration> = {
            let clients = self.clients.lock().unwrap_or_else(|e| e.into_inner());
            clients.values().map(|r| r.data.clone()).collect()
        };
        if snapshot.is_empty() {
            return;
        }

        let base = self.image_ready_payload(record);
        for client in snapshot {
            let payload = self.payload_for_client(&base, &client);
            let webhook = self.webhook.clone();
            let failures = self.delivery_failures.clone();
            tokio::spawn(async move {
                match webhook.send_notification(&client.uri, &payload).await {
                    Ok(()) => {
                        debug!(client = %client.client_name, "Image-ready notification delivered");
                    }
                    Err(e) => {
                        failures.fetch_add(1, Ordering::Relaxed);
                        error!(
                            client = %client.client_name,
                            uri = %client.uri,
                            error = %e,
                            "Image-ready notification failed"
                        );
                    }
                }
            });
        }
    }

    fn image_ready_payload(&self, record: &TriggerRecord) -> serde_json::Value {
        let mut payload = json!({
            "Type": "ImageAcquisition",
            "Timestamp": Utc::now().to_rfc3339(),
            "TriggerId": record.trigger_id,
            "PlantId": record.plant_id,
            "Status": if record.state == TriggerState::Finished { "success" } else { "error" },
        });

        if record.state == TriggerState::Finished {
            if let Some(dir) = &record.image_directory {
                payload["ImagePath"] = json!(format!(
                    "{}/{}/{}",
                    self.storage.bucket, self.storage.base_path, dir
                ));
                payload["ImageId"] = json!(format!("{}_{}", record.plant_id, dir));
            }
        }

        if !record.error_flags.is_success() {
            payload["Error"] = json!({
                "Code": record.error_flags.bits(),
                "Message": record.error_flags.to_string(),
            });
        }

        payload
    }

    fn payload_for_client(
        &self,
        base: &serde_json::Value,
        client: &ClientRegistration,
    ) -> serde_json::Value {
        let mut payload = base.clone();
        if !client.send_path_info {
            if let Some(map) = payload.as_object_mut() {
                map.remove("ImagePath");
            }
        }
        if client.send_data {
            warn!(
                client = %client.client_name,
                "SendData requested but binary payload delivery is not implemented"
            );
        }
        payload
    }

    fn spawn_heartbeat(&self, client_name: String, uri: String, period: Duration) -> JoinHandle<()> {
        let webhook = self.webhook.clone();
        info!(client = %client_name, period_ms = period.as_millis() as u64, "Starting heartbeat");
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; skip it so the first beat
            // lands one period after registration.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = webhook.send_heartbeat(&uri).await {
                    // Best-effort: keep the schedule regardless.
                    warn!(client = %client_name, error = %e, "Heartbeat delivery failed");
                }
            }
        })
    }
}

impl Drop for NotificationRegistry {
    fn drop(&mut self) {
        let clients = self.clients.lock().unwrap_or_else(|e| e.into_inner());
        for registered in clients.values() {
            if let Some(task) = &registered.heartbeat {
                task.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ErrorFlags;
    use axum::{routing::post, Json, Router};
    use tokio::sync::mpsc;

    fn registration(name: &str, uri: &str, heartbeat_ms: u64) -> ClientRegistration {
        ClientRegistration {
            client_name: name.into(),
            uri: uri.into(),
            send_path_info: true,
            send_data: false,
            heart_beat_interval: heartbeat_ms,
        }
    }

    fn finished_record() -> TriggerRecord {
        TriggerRecord {
            trigger_id: "t-1".into(),
            plant_id: "PLANT-1".into(),
            state: TriggerState::Finished,
            error_flags: ErrorFlags::SUCCESS,
            image_directory: Some("ImageSet_1".into()),
            fault: None,
            created_at: Utc::now(),
            completed_at: Some(Utc::now()),
        }
    }

    fn registry() -> Arc<NotificationRegistry> {
        Arc::new(
            NotificationRegistry::new(Duration::from_millis(500), StorageConfig::default())
                .expect("registry"),
        )
    }

    /// Start a webhook sink that forwards every received JSON payload.
    async fn spawn_sink() -> (String, mpsc::UnboundedReceiver<serde_json::Value>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let app = Router::new().route(
            "/hook",
            post(move |Json(body): Json<serde_json::Value>| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(body);
                    "ok"
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        (format!("http://{addr}/hook"), rx)
    }

    #[tokio::test]
    async fn test_register_rejects_bad_input() {
        let registry = registry();
        assert!(registry
            .register(registration("", "http://localhost/x", 0))
            .is_err());
        assert!(registry.register(registration("a", "", 0)).is_err());
        assert!(registry
            .register(registration("a", "not a uri", 0))
            .is_err());
    }

    #[tokio::test]
    async fn test_unregister_unknown_is_error_not_crash() {
        let registry = registry();
        registry
            .register(registration("alice", "http://localhost:1/x", 0))
            .expect("register");

        let result = registry.unregister("bob");
        assert!(matches!(result, Err(BridgeError::ClientNotRegistered(_))));
        // Other registrations unaffected.
        assert_eq!(registry.registered_names(), vec!["alice".to_string()]);
    }

    #[tokio::test]
    async fn test_reregister_replaces_atomically() {
        let registry = registry();
        let (uri, mut rx) = spawn_sink().await;
        registry
            .register(registration("alice", &uri, 1_000))
            .expect("first");

        let beat = tokio::time::timeout(Duration::from_secs(3), rx.recv())
            .await
            .expect("heartbeat within timeout")
            .expect("payload");
        assert_eq!(beat["Type"], "Heartbeat");

        // Re-registration without a heartbeat must stop the old timer.
        registry
            .register(registration("alice", "http://localhost:1/b", 0))
            .expect("second");
        assert_eq!(registry.registered_names(), vec!["alice".to_string()]);

        while rx.try_recv().is_ok() {}
        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert!(
            rx.try_recv().is_err(),
            "old heartbeat survived re-registration"
        );
    }

    #[tokio::test]
    async fn test_image_ready_delivers_shaped_payload() {
        let registry = registry();
        let (uri, mut rx) = spawn_sink().await;
        registry
            .register(registration("sink", &uri, 0))
            .expect("register");

        registry.notify_image_ready(&finished_record());

        let payload = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("delivery within timeout")
            .expect("payload");
        assert_eq!(payload["Type"], "ImageAcquisition");
        assert_eq!(payload["PlantId"], "PLANT-1");
        assert_eq!(payload["Status"], "success");
        assert_eq!(payload["ImageId"], "PLANT-1_ImageSet_1");
        assert_eq!(payload["ImagePath"], "imaging/images/ImageSet_1");
    }

    #[tokio::test]
    async fn test_path_info_stripped_when_not_requested() {
        let registry = registry();
        let (uri, mut rx) = spawn_sink().await;
        let mut reg = registration("sink", &uri, 0);
        reg.send_path_info = false;
        registry.register(reg).expect("register");

        registry.notify_image_ready(&finished_record());

        let payload = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("delivery")
            .expect("payload");
        assert!(payload.get("ImagePath").is_none());
        // ImageId is identity, not path info; it stays.
        assert_eq!(payload["ImageId"], "PLANT-1_ImageSet_1");
    }

    #[tokio::test]
    async fn test_unreachable_client_only_bumps_failure_counter() {
        let registry = registry();
        let (uri, mut rx) = spawn_sink().await;
        registry
            .register(registration("good", &uri, 0))
            .expect("register good");
        registry
            .register(registration("bad", "http://127.0.0.1:1/hook", 0))
            .expect("register bad");

        registry.notify_image_ready(&finished_record());

        // Reachable client still gets its event.
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("delivery")
            .expect("payload");

        // Failed delivery shows up in the counter, nowhere else.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while registry.delivery_failures() == 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(registry.delivery_failures(), 1);
    }

    #[tokio::test]
    async fn test_heartbeat_runs_until_unregister() {
        let registry = registry();
        let (uri, mut rx) = spawn_sink().await;
        registry
            .register(registration("beat", &uri, 1_000))
            .expect("register");

        let beat = tokio::time::timeout(Duration::from_secs(3), rx.recv())
            .await
            .expect("heartbeat within timeout")
            .expect("payload");
        assert_eq!(beat["Type"], "Heartbeat");
        assert_eq!(beat["Status"], "alive");

        registry.unregister("beat").expect("unregister");
        // Drain anything already in flight, then verify silence.
        while rx.try_recv().is_ok() {}
        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert!(rx.try_recv().is_err(), "heartbeat survived unregister");
    }

    #[tokio::test]
    async fn test_delivery_honors_webhook_timeout() {
        // Peer that accepts the connection but never answers.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let _stream = stream;
                    tokio::time::sleep(Duration::from_secs(60)).await;
                });
            }
        });

        let webhook = WebhookClient::new(Duration::from_millis(200)).expect("client");
        let start = tokio::time::Instant::now();
        let result = webhook
            .send_notification(&format!("http://{addr}/hook"), &json!({"Type": "Test"}))
            .await;
        assert!(result.is_err(), "delivery to a silent peer must fail");
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_error_record_payload_carries_flags() {
        let registry = registry();
        let (uri, mut rx) = spawn_sink().await;
        registry
            .register(registration("sink", &uri, 0))
            .expect("register");

        let record = TriggerRecord {
            state: TriggerState::Error,
            error_flags: ErrorFlags::from_bits(14),
            image_directory: None,
            ..finished_record()
        };
        registry.notify_image_ready(&record);

        let payload = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("delivery")
            .expect("payload");
        assert_eq!(payload["Status"], "error");
        assert_eq!(payload["Error"]["Code"], 14);
        assert!(payload.get("ImageId").is_none());
    }
}
