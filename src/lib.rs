//! Multi-version OCPP gateway.
//!
//! Charge points connect over WebSocket with an OCPP subprotocol; every frame is
//! translated into one canonical message shape before it reaches a handler, and
//! commands sent back are shaped for the dialect each connection negotiated.

pub mod api;
pub mod auth;
pub mod config;
pub mod domain;
pub mod gateway;
pub mod ocpp;
pub mod telemetry;
