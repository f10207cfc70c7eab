//! OCPP 2.1 adapter
//!
//! 2.1 keeps the 2.0.1 payloads for every action the gateway reshapes; newer
//! 2.1-only actions pass through untouched.

use serde_json::Value;

use super::{v2, ConversionError, ProtocolAdapter};
use crate::ocpp::version::OcppProtocol;

#[derive(Debug, Clone, Copy, Default)]
pub struct Ocpp21Adapter;

impl ProtocolAdapter for Ocpp21Adapter {
    fn protocol(&self) -> OcppProtocol {
        OcppProtocol::Ocpp21
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ocpp::wire::{Call, OcppMessage};
    use serde_json::json;

    #[test]
    fn test_messages_are_tagged_2_1() {
        let msg = OcppMessage::Call(Call {
            message_id: "n1".into(),
            action: "Authorize".into(),
            payload: json!({"idToken": {"idToken": "TAG-1", "type": "eMAID"}}),
        });
        let internal = Ocpp21Adapter.to_internal(&msg, "CS-21").unwrap();
        assert_eq!(internal.protocol, OcppProtocol::Ocpp21);
        assert_eq!(internal.payload, json!({"idTag": "TAG-1", "idTokenType": "eMAID"}));
        assert_eq!(Ocpp21Adapter.from_internal(&internal).unwrap(), msg);
    }

    #[test]
    fn test_2_1_only_actions_pass_through() {
        let payload = json!({"transactionId": "tx-1", "totalCost": 12.5});
        let msg = OcppMessage::Call(Call {
            message_id: "n2".into(),
            action: "CostUpdated".into(),
            payload: payload.clone(),
        });
        let internal = Ocpp21Adapter.to_internal(&msg, "CS-21").unwrap();
        assert_eq!(internal.action, "CostUpdated");
        assert_eq!(internal.payload, payload);
    }
}
