//! Protocol adapter routing
//!
//! [`ProtocolAdapterManager`] picks the adapter for a connection's negotiated
//! protocol, runs the structural checks and reports every conversion on a
//! bounded event channel. A full channel drops events; conversion never waits
//! on the consumer.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::sync::Arc;
use strum::IntoEnumIterator;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::adapter::{default_registry, AdapterRegistry, ConversionError, ProtocolAdapter};
use super::canonical::InternalMessage;
use super::version::OcppProtocol;
use super::wire::OcppMessage;

static ACTION_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9]{0,63}$").expect("valid action pattern"));

/// OCPP caps message ids at 36 characters.
const MAX_MESSAGE_ID_LEN: usize = 36;

/// Diagnostic events published by the manager.
#[derive(Debug, Clone)]
pub enum AdapterEvent {
    Converted(InternalMessage),
    ConversionFailed {
        charge_point_id: String,
        protocol: OcppProtocol,
        message_id: String,
        error: ConversionError,
    },
}

pub struct ProtocolAdapterManager {
    adapters: AdapterRegistry,
    enable_validation: bool,
    events: Option<mpsc::Sender<AdapterEvent>>,
}

impl ProtocolAdapterManager {
    /// Manager with the built-in 1.6, 2.0 and 2.1 adapters.
    pub fn new(enable_validation: bool, events: Option<mpsc::Sender<AdapterEvent>>) -> Self {
        Self::with_registry(default_registry(), enable_validation, events)
    }

    pub fn with_registry(
        adapters: AdapterRegistry,
        enable_validation: bool,
        events: Option<mpsc::Sender<AdapterEvent>>,
    ) -> Self {
        Self {
            adapters,
            enable_validation,
            events,
        }
    }

    pub fn register(&mut self, adapter: Arc<dyn ProtocolAdapter>) {
        self.adapters.insert(adapter.protocol(), adapter);
    }

    pub fn adapter(&self, protocol: OcppProtocol) -> Result<&Arc<dyn ProtocolAdapter>, ConversionError> {
        self.adapters
            .get(&protocol)
            .ok_or(ConversionError::UnsupportedProtocol(protocol))
    }

    pub fn is_protocol_supported(&self, protocol: OcppProtocol) -> bool {
        self.adapters.contains_key(&protocol)
    }

    /// Registered protocols in a stable order.
    pub fn supported_protocols(&self) -> Vec<OcppProtocol> {
        OcppProtocol::iter()
            .filter(|p| self.adapters.contains_key(p))
            .collect()
    }

    pub fn validation_enabled(&self) -> bool {
        self.enable_validation
    }

    pub fn convert_to_internal(
        &self,
        msg: &OcppMessage,
        charge_point_id: &str,
        protocol: OcppProtocol,
    ) -> Result<InternalMessage, ConversionError> {
        let result = self
            .validate_ocpp_message(msg, protocol)
            .and_then(|_| self.adapter(protocol))
            .and_then(|adapter| adapter.to_internal(msg, charge_point_id))
            .and_then(|internal| self.validate_internal_message(&internal).map(|_| internal));

        match &result {
            Ok(internal) => self.publish(AdapterEvent::Converted(internal.clone())),
            Err(error) => self.publish(AdapterEvent::ConversionFailed {
                charge_point_id: charge_point_id.to_string(),
                protocol,
                message_id: msg.message_id().to_string(),
                error: error.clone(),
            }),
        }
        result
    }

    pub fn convert_from_internal(&self, msg: &InternalMessage) -> Result<OcppMessage, ConversionError> {
        let result = self
            .validate_internal_message(msg)
            .and_then(|_| self.adapter(msg.protocol))
            .and_then(|adapter| adapter.from_internal(msg));

        if let Err(error) = &result {
            self.publish(AdapterEvent::ConversionFailed {
                charge_point_id: msg.charge_point_id.clone(),
                protocol: msg.protocol,
                message_id: msg.message_id.clone(),
                error: error.clone(),
            });
        }
        result
    }

    /// Canonicalize the CALLRESULT payload a charge point sent for `action`.
    pub fn convert_result(
        &self,
        protocol: OcppProtocol,
        action: &str,
        payload: Value,
    ) -> Result<Value, ConversionError> {
        self.adapter(protocol)?.response_to_canonical(action, payload)
    }

    /// Structural checks on a wire message, independent of any adapter.
    pub fn validate_ocpp_message(
        &self,
        msg: &OcppMessage,
        protocol: OcppProtocol,
    ) -> Result<(), ConversionError> {
        if !self.enable_validation {
            return Ok(());
        }
        check_message_id(msg.message_id())?;
        if let Some(action) = msg.action() {
            check_action(action)?;
        }
        if !self.is_protocol_supported(protocol) {
            return Err(ConversionError::UnsupportedProtocol(protocol));
        }
        Ok(())
    }

    /// Structural checks on a canonical message, independent of any adapter.
    pub fn validate_internal_message(&self, msg: &InternalMessage) -> Result<(), ConversionError> {
        if !self.enable_validation {
            return Ok(());
        }
        check_message_id(&msg.message_id)?;
        check_action(&msg.action)?;
        if msg.charge_point_id.is_empty() {
            return Err(ConversionError::Validation("chargePointId is empty".into()));
        }
        if !msg.payload.is_object() {
            return Err(ConversionError::Validation("payload must be a JSON object".into()));
        }
        if !self.is_protocol_supported(msg.protocol) {
            return Err(ConversionError::UnsupportedProtocol(msg.protocol));
        }
        Ok(())
    }

    fn publish(&self, event: AdapterEvent) {
        let Some(tx) = &self.events else { return };
        if let Err(e) = tx.try_send(event) {
            match e {
                mpsc::error::TrySendError::Full(_) => warn!("adapter event channel full, dropping event"),
                mpsc::error::TrySendError::Closed(_) => debug!("adapter event channel closed"),
            }
        }
    }
}

fn check_message_id(id: &str) -> Result<(), ConversionError> {
    if id.is_empty() {
        return Err(ConversionError::Validation("messageId is empty".into()));
    }
    if id.len() > MAX_MESSAGE_ID_LEN {
        return Err(ConversionError::Validation(format!(
            "messageId exceeds {MAX_MESSAGE_ID_LEN} characters"
        )));
    }
    Ok(())
}

fn check_action(action: &str) -> Result<(), ConversionError> {
    if ACTION_NAME.is_match(action) {
        Ok(())
    } else {
        Err(ConversionError::Validation(format!("malformed action {action:?}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ocpp::wire::Call;
    use serde_json::json;

    fn heartbeat(id: &str) -> OcppMessage {
        OcppMessage::Call(Call {
            message_id: id.into(),
            action: "Heartbeat".into(),
            payload: json!({}),
        })
    }

    #[test]
    fn test_supported_protocols() {
        let manager = ProtocolAdapterManager::new(true, None);
        assert_eq!(
            manager.supported_protocols(),
            vec![OcppProtocol::Ocpp16, OcppProtocol::Ocpp20, OcppProtocol::Ocpp21]
        );
        assert!(manager.is_protocol_supported(OcppProtocol::Ocpp21));
    }

    #[test]
    fn test_missing_adapter_is_a_typed_error() {
        let mut registry = default_registry();
        registry.remove(&OcppProtocol::Ocpp21);
        let manager = ProtocolAdapterManager::with_registry(registry, false, None);
        assert_eq!(
            manager.convert_to_internal(&heartbeat("1"), "CP", OcppProtocol::Ocpp21),
            Err(ConversionError::UnsupportedProtocol(OcppProtocol::Ocpp21))
        );
    }

    #[test]
    fn test_validation_rejects_oversized_id_and_can_be_disabled() {
        let long_id = "x".repeat(40);
        let strict = ProtocolAdapterManager::new(true, None);
        assert!(matches!(
            strict.convert_to_internal(&heartbeat(&long_id), "CP", OcppProtocol::Ocpp16),
            Err(ConversionError::Validation(_))
        ));

        let lenient = ProtocolAdapterManager::new(false, None);
        assert!(lenient
            .convert_to_internal(&heartbeat(&long_id), "CP", OcppProtocol::Ocpp16)
            .is_ok());
    }

    #[test]
    fn test_malformed_action_fails_validation() {
        let manager = ProtocolAdapterManager::new(true, None);
        let msg = OcppMessage::Call(Call {
            message_id: "1".into(),
            action: "Drop Table".into(),
            payload: json!({}),
        });
        assert!(matches!(
            manager.validate_ocpp_message(&msg, OcppProtocol::Ocpp16),
            Err(ConversionError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_events_are_published() {
        let (tx, mut rx) = mpsc::channel(8);
        let manager = ProtocolAdapterManager::new(true, Some(tx));

        manager
            .convert_to_internal(&heartbeat("1"), "CP-1", OcppProtocol::Ocpp16)
            .unwrap();
        let bad = OcppMessage::Call(Call {
            message_id: "2".into(),
            action: "Authorize".into(),
            payload: json!({"wrong": true}),
        });
        assert!(manager
            .convert_to_internal(&bad, "CP-1", OcppProtocol::Ocpp16)
            .is_err());

        match rx.recv().await.unwrap() {
            AdapterEvent::Converted(msg) => assert_eq!(msg.action, "Heartbeat"),
            other => panic!("unexpected event {other:?}"),
        }
        match rx.recv().await.unwrap() {
            AdapterEvent::ConversionFailed { message_id, error, .. } => {
                assert_eq!(message_id, "2");
                assert!(matches!(error, ConversionError::InvalidPayload { .. }));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_full_event_channel_does_not_block() {
        let (tx, _rx) = mpsc::channel(1);
        let manager = ProtocolAdapterManager::new(true, Some(tx));
        for i in 0..5 {
            assert!(manager
                .convert_to_internal(&heartbeat(&i.to_string()), "CP-1", OcppProtocol::Ocpp16)
                .is_ok());
        }
    }
}
