//! Custom error types for the application.
//!
//! This module defines the primary error type, `BridgeError`, for the entire
//! service. Using the `thiserror` crate, it provides a centralized and
//! consistent way to handle the different failure classes the bridge can hit:
//!
//! - **`Config`** / **`Configuration`**: loading errors from figment and
//!   semantic validation errors caught after parsing.
//! - **`Io`**: file and network I/O, including the device channel socket.
//! - **`ChannelTimeout`** / **`ChannelProtocol`**: the two terminal per-exchange
//!   failures of the message channel client. Neither is retried inside the
//!   client; the trigger path translates both into a terminal `Error` state.
//! - **`CompletionConflict`**: a second `complete` call on a trigger with a
//!   different terminal outcome than the first. The registry keeps the first
//!   outcome and reports this instead of silently accepting the rewrite.
//!
//! By using `#[from]`, `BridgeError` can be seamlessly created from underlying
//! error types with the `?` operator.

use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type BridgeResult<T> = std::result::Result<T, BridgeError>;

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Channel not connected")]
    ChannelNotConnected,

    #[error("Channel timeout after {0:?}")]
    ChannelTimeout(Duration),

    #[error("Channel protocol error: {0}")]
    ChannelProtocol(String),

    #[error("Unknown trigger id: {0}")]
    UnknownTrigger(String),

    #[error("Trigger {trigger_id} already completed with a different outcome")]
    CompletionConflict { trigger_id: String },

    #[error("Client '{0}' is not registered")]
    ClientNotRegistered(String),

    #[error("Invalid registration: {0}")]
    InvalidRegistration(String),

    #[error("Webhook delivery failed: {0}")]
    WebhookDelivery(String),
}
