//! Core library for the imaging-bridge service.
//!
//! This library bridges a synchronous REST API to the line-oriented command
//! channel of a remote plant-imaging device. It tracks the lifecycle of every
//! acquisition trigger, turns the device's fire-and-forget transport into
//! request/response semantics with timeouts, and fans out image-ready and
//! heartbeat events to registered webhook clients.

pub mod api;
pub mod channel;
pub mod config;
pub mod error;
pub mod metadata;
pub mod notify;
pub mod protocol;
pub mod simulator;
pub mod trigger;
