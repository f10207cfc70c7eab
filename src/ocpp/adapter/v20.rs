//! OCPP 2.0 / 2.0.1 adapter

use serde_json::Value;

use super::{v2, ConversionError, ProtocolAdapter};
use crate::ocpp::version::OcppProtocol;

#[derive(Debug, Clone, Copy, Default)]
pub struct Ocpp20Adapter;

impl ProtocolAdapter for Ocpp20Adapter {
    fn protocol(&self) -> OcppProtocol {
        OcppProtocol::Ocpp20
    }

    fn request_to_canonical(&self, action: &str, payload: Value) -> Result<Value, ConversionError> {
        v2::request_to_canonical(action, payload)
    }

    fn request_from_canonical(&self, action: &str, payload: Value) -> Result<Value, ConversionError> {
        v2::request_from_canonical(action, payload)
    }

    fn response_to_canonical(&self, action: &str, payload: Value) -> Result<Value, ConversionError> {
        v2::response_to_canonical(action, payload)
    }

    fn response_from_canonical(&self, action: &str, payload: Value) -> Result<Value, ConversionError> {
        v2::response_from_canonical(action, payload)
    }
}
