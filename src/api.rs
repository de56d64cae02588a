//! REST surface of the bridge.
//!
//! Every endpoint answers with the uniform response envelope (`Values` plus a
//! typed `Message`), always with HTTP 200: the caller contract distinguishes
//! outcomes by `Message.Type`, not status codes. The registries are owned
//! state objects injected through [`AppState`]; handlers never reach into
//! their internals.
//!
//! The trigger path is split in two: `PUT /trigger/{plantId}` records a Busy
//! trigger and returns its id immediately, while the device exchange runs in
//! a background task that completes the registry entry and kicks off the
//! notification fan-out. Status polls read the registry only.

use axum::extract::{Path, Query, State};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::channel::ChannelClient;
use crate::config::Settings;
use crate::error::{BridgeError, BridgeResult};
use crate::metadata::{ImagingMetadata, MetadataSlot, SettingsCatalog};
use crate::notify::{ClientRegistration, NotificationRegistry};
use crate::protocol::{ErrorFlags, TriggerCommand};
use crate::trigger::{ChannelFault, TriggerRegistry, TriggerState, TriggerView};

/// Message object carried by every response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiMessage {
    /// Extra info about the status of the call
    #[serde(rename = "MessageText")]
    pub message_text: String,
    /// One of: None, Error, Warning, Message, Success
    #[serde(rename = "Type")]
    pub message_type: MessageType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageType {
    None,
    Error,
    Warning,
    Message,
    Success,
}

impl ApiMessage {
    pub fn none() -> Self {
        Self {
            message_text: String::new(),
            message_type: MessageType::None,
        }
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self {
            message_text: text.into(),
            message_type: MessageType::Error,
        }
    }

    pub fn warning(text: impl Into<String>) -> Self {
        Self {
            message_text: text.into(),
            message_type: MessageType::Warning,
        }
    }

    pub fn message(text: impl Into<String>) -> Self {
        Self {
            message_text: text.into(),
            message_type: MessageType::Message,
        }
    }

    pub fn success() -> Self {
        Self {
            message_text: String::new(),
            message_type: MessageType::Success,
        }
    }
}

/// Uniform result carrier returned by every endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse {
    #[serde(rename = "Values", default)]
    pub values: Vec<String>,
    #[serde(rename = "Message")]
    pub message: ApiMessage,
}

impl ApiResponse {
    pub fn success(values: Vec<String>) -> Self {
        Self {
            values,
            message: ApiMessage::success(),
        }
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self {
            values: Vec::new(),
            message: ApiMessage::error(text),
        }
    }

    pub fn warning(text: impl Into<String>) -> Self {
        Self {
            values: Vec::new(),
            message: ApiMessage::warning(text),
        }
    }

    pub fn message(text: impl Into<String>) -> Self {
        Self {
            values: Vec::new(),
            message: ApiMessage::message(text),
        }
    }
}

/// Shared application state injected into every handler.
#[derive(Clone)]
pub struct AppState {
    pub channel: Arc<ChannelClient>,
    pub triggers: Arc<TriggerRegistry>,
    pub notifications: Arc<NotificationRegistry>,
    pub metadata: Arc<MetadataSlot>,
    pub catalog: Arc<SettingsCatalog>,
}

impl AppState {
    /// Wire up all components from loaded settings.
    pub fn from_settings(settings: &Settings) -> BridgeResult<Self> {
        let channel = Arc::new(ChannelClient::new(
            settings.channel.endpoint(),
            std::time::Duration::from_millis(settings.channel.timeout_ms),
        ));
        let triggers = Arc::new(TriggerRegistry::new(settings.triggers.retention_cap));
        let notifications = Arc::new(NotificationRegistry::new(
            std::time::Duration::from_millis(settings.notify.webhook_timeout_ms),
            settings.storage.clone(),
        )?);
        let metadata = Arc::new(MetadataSlot::new());
        let catalog = Arc::new(SettingsCatalog::from_dir(&settings.application.settings_dir));

        Ok(Self {
            channel,
            triggers,
            notifications,
            metadata,
            catalog,
        })
    }
}

/// Build the axum router for the bridge API.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/status", get(get_status))
        .route("/status/:trigger_id", get(get_trigger_status))
        .route("/settings", get(list_settings))
        .route("/settings/:name", put(apply_settings))
        .route("/metadata", post(set_metadata))
        .route("/trigger/:plant_id", put(trigger))
        .route("/getimageid/:trigger_id", get(get_image_id))
        .route("/register", post(register))
        .route("/unregister", post(unregister))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Overall device state: `busy` with the busy trigger id while any exchange
/// is in flight, `idle` otherwise.
async fn get_status(State(state): State<AppState>) -> Json<ApiResponse> {
    match state.triggers.any_busy() {
        Some(trigger_id) => Json(ApiResponse {
            values: vec![trigger_id],
            message: ApiMessage::message("busy"),
        }),
        None => Json(ApiResponse::message("idle")),
    }
}

async fn list_settings(State(state): State<AppState>) -> Json<ApiResponse> {
    Json(ApiResponse {
        values: state.catalog.names().to_vec(),
        message: ApiMessage::none(),
    })
}

async fn apply_settings(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Json<ApiResponse> {
    if state.catalog.select(&name) {
        Json(ApiResponse::success(Vec::new()))
    } else {
        Json(ApiResponse::error(format!(
            "Settings file '{name}' not found"
        )))
    }
}

async fn set_metadata(
    State(state): State<AppState>,
    Json(metadata): Json<ImagingMetadata>,
) -> Json<ApiResponse> {
    state.metadata.set(metadata);
    Json(ApiResponse::success(Vec::new()))
}

/// Start an acquisition for `plant_id`.
///
/// Validates the pending metadata, records a Busy trigger, and hands the
/// device exchange to a background task. The response carries the trigger id
/// the caller polls with.
async fn trigger(State(state): State<AppState>, Path(plant_id): Path<String>) -> Json<ApiResponse> {
    let Some(metadata) = state.metadata.current() else {
        return Json(ApiResponse::error("No metadata provided before trigger"));
    };

    if metadata.plant_id != plant_id {
        return Json(ApiResponse::warning(format!(
            "Plant ID mismatch: {} != {}",
            plant_id, metadata.plant_id
        )));
    }

    let command = TriggerCommand::new(&metadata, state.catalog.selected());
    let trigger_id = state.triggers.create(&plant_id);
    info!(%trigger_id, %plant_id, "Trigger accepted");

    let task_state = state.clone();
    let task_trigger_id = trigger_id.clone();
    tokio::spawn(async move {
        process_trigger(task_state, task_trigger_id, command).await;
    });

    Json(ApiResponse::success(vec![trigger_id]))
}

async fn get_trigger_status(
    State(state): State<AppState>,
    Path(trigger_id): Path<String>,
) -> Json<ApiResponse> {
    let view = state.triggers.get(&trigger_id);
    Json(ApiResponse::message(view.status_str()))
}

async fn get_image_id(
    State(state): State<AppState>,
    Path(trigger_id): Path<String>,
) -> Json<ApiResponse> {
    match state.triggers.get(&trigger_id) {
        TriggerView::Invalid => Json(ApiResponse::error("Invalid trigger ID")),
        TriggerView::Known(record) => match record.image_id() {
            Some(image_id) => Json(ApiResponse::success(vec![image_id])),
            None if record.state == TriggerState::Finished => {
                Json(ApiResponse::error("Image ID not available"))
            }
            None => Json(ApiResponse::error(format!(
                "Image not available, status: {}",
                record.state.as_status_str()
            ))),
        },
    }
}

async fn register(
    State(state): State<AppState>,
    Json(registration): Json<ClientRegistration>,
) -> Json<ApiResponse> {
    match state.notifications.register(registration) {
        Ok(()) => Json(ApiResponse::success(Vec::new())),
        Err(e) => Json(ApiResponse::error(e.to_string())),
    }
}

#[derive(Debug, Deserialize)]
struct UnregisterQuery {
    #[serde(rename = "ClientName")]
    client_name: String,
}

async fn unregister(
    State(state): State<AppState>,
    Query(query): Query<UnregisterQuery>,
) -> Json<ApiResponse> {
    match state.notifications.unregister(&query.client_name) {
        Ok(()) => Json(ApiResponse::success(Vec::new())),
        Err(e) => Json(ApiResponse::error(e.to_string())),
    }
}

/// Run the device exchange for one trigger and settle its registry record.
///
/// Every exit path leaves the trigger terminal: a device reply completes it
/// with the reply's flags, a channel fault completes it with the reserved
/// FatalUnknown flag and the fault kind. Notification fan-out happens only
/// after the registry is marked terminal, and its outcome never affects the
/// trigger.
async fn process_trigger(state: AppState, trigger_id: String, command: TriggerCommand) {
    let completion = match state.channel.send_trigger(&command).await {
        Ok(reply) => {
            info!(
                %trigger_id,
                flags = %reply.flags,
                image_directory = reply.image_directory.as_deref().unwrap_or("-"),
                "Device reply received"
            );
            state
                .triggers
                .complete(&trigger_id, reply.flags, reply.image_directory, None)
        }
        Err(e) => {
            let fault = match &e {
                BridgeError::ChannelTimeout(_) => ChannelFault::Timeout,
                BridgeError::ChannelProtocol(_) => ChannelFault::Protocol,
                _ => ChannelFault::Transport,
            };
            error!(%trigger_id, error = %e, ?fault, "Channel exchange failed");
            state
                .triggers
                .complete(&trigger_id, ErrorFlags::FATAL_UNKNOWN, None, Some(fault))
        }
    };

    match completion {
        Ok(record) => state.notifications.notify_image_ready(&record),
        Err(e) => error!(%trigger_id, error = %e, "Trigger completion failed"),
    }
}
