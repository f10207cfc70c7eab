//! Per-version protocol adapters
//!
//! An adapter is a pure translator between one OCPP wire dialect and the
//! canonical model in [`crate::ocpp::canonical`]. Adapters are registered by
//! [`OcppProtocol`] and selected by table lookup. They never decide business
//! outcomes.

use chrono::Utc;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

use super::canonical::{InternalMessage, MessageKind};
use super::version::OcppProtocol;
use super::wire::{Call, CallResult, ErrorCode, MessageType, OcppMessage};

pub mod v16;
pub mod v2;
pub mod v20;
pub mod v21;

pub use v16::Ocpp16Adapter;
pub use v20::Ocpp20Adapter;
pub use v21::Ocpp21Adapter;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ConversionError {
    #[error("{protocol} has no equivalent for action {action}")]
    UnsupportedAction {
        protocol: OcppProtocol,
        action: String,
    },

    #[error("invalid {action} payload: {reason}")]
    InvalidPayload { action: String, reason: String },

    #[error("only CALL frames carry an action, got {0:?}")]
    NotACall(MessageType),

    #[error("no adapter registered for {0}")]
    UnsupportedProtocol(OcppProtocol),

    #[error("validation failed: {0}")]
    Validation(String),
}

impl ConversionError {
    /// CALLERROR code reported back to the charge point.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::UnsupportedAction { .. } | Self::UnsupportedProtocol(_) => ErrorCode::NotSupported,
            Self::InvalidPayload { .. } => ErrorCode::FormationViolation,
            Self::NotACall(_) | Self::Validation(_) => ErrorCode::ProtocolError,
        }
    }

    pub(crate) fn invalid(action: &str, reason: impl ToString) -> Self {
        Self::InvalidPayload {
            action: action.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Which side of the link starts an exchange for a given action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Initiator {
    ChargePoint,
    CentralSystem,
    Either,
}

/// One row of the action classification table.
#[derive(Debug, Clone, Copy)]
pub struct ActionSpec {
    pub canonical: &'static str,
    pub v16: Option<&'static str>,
    pub v2: Option<&'static str>,
    pub initiator: Initiator,
}

const fn spec(
    canonical: &'static str,
    v16: Option<&'static str>,
    v2: Option<&'static str>,
    initiator: Initiator,
) -> ActionSpec {
    ActionSpec {
        canonical,
        v16,
        v2,
        initiator,
    }
}

use Initiator::{CentralSystem, ChargePoint, Either};

/// Actions the gateway knows about. Anything absent passes through with its
/// wire name unchanged.
pub static ACTIONS: &[ActionSpec] = &[
    spec("BootNotification", Some("BootNotification"), Some("BootNotification"), ChargePoint),
    spec("Heartbeat", Some("Heartbeat"), Some("Heartbeat"), ChargePoint),
    spec("Authorize", Some("Authorize"), Some("Authorize"), ChargePoint),
    spec("StatusNotification", Some("StatusNotification"), Some("StatusNotification"), ChargePoint),
    spec("MeterValues", Some("MeterValues"), Some("MeterValues"), ChargePoint),
    spec("StartTransaction", Some("StartTransaction"), None, ChargePoint),
    spec("StopTransaction", Some("StopTransaction"), None, ChargePoint),
    spec("TransactionEvent", None, Some("TransactionEvent"), ChargePoint),
    spec("FirmwareStatusNotification", Some("FirmwareStatusNotification"), Some("FirmwareStatusNotification"), ChargePoint),
    spec("DiagnosticsStatusNotification", Some("DiagnosticsStatusNotification"), None, ChargePoint),
    spec("SecurityEventNotification", None, Some("SecurityEventNotification"), ChargePoint),
    spec("NotifyReport", None, Some("NotifyReport"), ChargePoint),
    spec("RemoteStartTransaction", Some("RemoteStartTransaction"), Some("RequestStartTransaction"), CentralSystem),
    spec("RemoteStopTransaction", Some("RemoteStopTransaction"), Some("RequestStopTransaction"), CentralSystem),
    spec("GetConfiguration", Some("GetConfiguration"), None, CentralSystem),
    spec("ChangeConfiguration", Some("ChangeConfiguration"), None, CentralSystem),
    spec("GetVariables", None, Some("GetVariables"), CentralSystem),
    spec("SetVariables", None, Some("SetVariables"), CentralSystem),
    spec("Reset", Some("Reset"), Some("Reset"), CentralSystem),
    spec("ChangeAvailability", Some("ChangeAvailability"), Some("ChangeAvailability"), CentralSystem),
    spec("UnlockConnector", Some("UnlockConnector"), Some("UnlockConnector"), CentralSystem),
    spec("ClearCache", Some("ClearCache"), Some("ClearCache"), CentralSystem),
    spec("SetChargingProfile", Some("SetChargingProfile"), Some("SetChargingProfile"), CentralSystem),
    spec("ClearChargingProfile", Some("ClearChargingProfile"), Some("ClearChargingProfile"), CentralSystem),
    spec("TriggerMessage", Some("TriggerMessage"), Some("TriggerMessage"), CentralSystem),
    spec("ReserveNow", Some("ReserveNow"), Some("ReserveNow"), CentralSystem),
    spec("CancelReservation", Some("CancelReservation"), Some("CancelReservation"), CentralSystem),
    spec("DataTransfer", Some("DataTransfer"), Some("DataTransfer"), Either),
];

fn wire_column(spec: &ActionSpec, protocol: OcppProtocol) -> Option<&'static str> {
    match protocol {
        OcppProtocol::Ocpp16 => spec.v16,
        OcppProtocol::Ocpp20 | OcppProtocol::Ocpp21 => spec.v2,
    }
}

pub fn action_spec(canonical: &str) -> Option<&'static ActionSpec> {
    ACTIONS.iter().find(|s| s.canonical == canonical)
}

/// Maps a wire action name to its canonical name.
pub fn canonical_action(protocol: OcppProtocol, wire: &str) -> Result<String, ConversionError> {
    if let Some(spec) = ACTIONS.iter().find(|s| wire_column(s, protocol) == Some(wire)) {
        return Ok(spec.canonical.to_string());
    }
    match action_spec(wire) {
        // A canonical name the dialect spells differently or lacks entirely.
        Some(_) => Err(ConversionError::UnsupportedAction {
            protocol,
            action: wire.to_string(),
        }),
        None => Ok(wire.to_string()),
    }
}

/// Maps a canonical action name to the wire name for `protocol`.
pub fn wire_action(protocol: OcppProtocol, canonical: &str) -> Result<String, ConversionError> {
    match action_spec(canonical) {
        Some(spec) => wire_column(spec, protocol)
            .map(str::to_string)
            .ok_or_else(|| ConversionError::UnsupportedAction {
                protocol,
                action: canonical.to_string(),
            }),
        None => Ok(canonical.to_string()),
    }
}

/// True when the central system may originate a CALL for this action.
pub fn is_outbound_command(canonical: &str) -> bool {
    action_spec(canonical)
        .map(|s| s.initiator != Initiator::ChargePoint)
        .unwrap_or(true)
}

pub(crate) fn decode<T: DeserializeOwned>(action: &str, payload: Value) -> Result<T, ConversionError> {
    serde_json::from_value(payload).map_err(|e| ConversionError::invalid(action, e))
}

/// Decode a wire or canonical payload, transform it, re-encode the result.
pub(crate) fn reshape<A, B>(
    action: &str,
    payload: Value,
    f: impl FnOnce(A) -> Result<B, ConversionError>,
) -> Result<Value, ConversionError>
where
    A: DeserializeOwned,
    B: Serialize,
{
    let input: A = decode(action, payload)?;
    encode(action, &f(input)?)
}

pub(crate) fn encode<T: Serialize>(action: &str, value: &T) -> Result<Value, ConversionError> {
    serde_json::to_value(value).map_err(|e| ConversionError::invalid(action, e))
}

/// Translator between one wire dialect and the canonical model.
///
/// Implementors provide the payload shaping for each direction, keyed by the
/// canonical action name. `to_internal` and `from_internal` handle the framing
/// and action naming on top of that and are not meant to be overridden.
pub trait ProtocolAdapter: Send + Sync {
    fn protocol(&self) -> OcppProtocol;

    /// Wire CALL payload -> canonical request payload.
    fn request_to_canonical(&self, action: &str, payload: Value) -> Result<Value, ConversionError>;

    /// Canonical request payload -> wire CALL payload.
    fn request_from_canonical(&self, action: &str, payload: Value) -> Result<Value, ConversionError>;

    /// Wire CALLRESULT payload -> canonical response payload.
    fn response_to_canonical(&self, action: &str, payload: Value) -> Result<Value, ConversionError>;

    /// Canonical response payload -> wire CALLRESULT payload.
    fn response_from_canonical(&self, action: &str, payload: Value) -> Result<Value, ConversionError>;

    fn to_internal(
        &self,
        msg: &OcppMessage,
        charge_point_id: &str,
    ) -> Result<InternalMessage, ConversionError> {
        let OcppMessage::Call(call) = msg else {
            return Err(ConversionError::NotACall(msg.message_type()));
        };
        let action = canonical_action(self.protocol(), &call.action)?;
        let payload = self.request_to_canonical(&action, call.payload.clone())?;
        Ok(InternalMessage {
            message_id: call.message_id.clone(),
            charge_point_id: charge_point_id.to_string(),
            action,
            kind: MessageKind::Request,
            payload,
            timestamp: Utc::now(),
            protocol: self.protocol(),
        })
    }

    fn from_internal(&self, msg: &InternalMessage) -> Result<OcppMessage, ConversionError> {
        match msg.kind {
            MessageKind::Request => {
                let action = wire_action(self.protocol(), &msg.action)?;
                let payload = self.request_from_canonical(&msg.action, msg.payload.clone())?;
                Ok(OcppMessage::Call(Call {
                    message_id: msg.message_id.clone(),
                    action,
                    payload,
                }))
            }
            MessageKind::Response => {
                // The action must exist on this dialect even though the name is not sent.
                wire_action(self.protocol(), &msg.action)?;
                let payload = self.response_from_canonical(&msg.action, msg.payload.clone())?;
                Ok(OcppMessage::CallResult(CallResult {
                    message_id: msg.message_id.clone(),
                    payload,
                }))
            }
        }
    }
}

/// Registry of adapters keyed by protocol family.
pub type AdapterRegistry = HashMap<OcppProtocol, Arc<dyn ProtocolAdapter>>;

/// One adapter per supported protocol family.
pub fn default_registry() -> AdapterRegistry {
    let adapters: [Arc<dyn ProtocolAdapter>; 3] = [
        Arc::new(Ocpp16Adapter),
        Arc::new(Ocpp20Adapter),
        Arc::new(Ocpp21Adapter),
    ];
    adapters.into_iter().map(|a| (a.protocol(), a)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(OcppProtocol::Ocpp16, "RemoteStartTransaction", "RemoteStartTransaction")]
    #[case(OcppProtocol::Ocpp20, "RequestStartTransaction", "RemoteStartTransaction")]
    #[case(OcppProtocol::Ocpp21, "RequestStopTransaction", "RemoteStopTransaction")]
    #[case(OcppProtocol::Ocpp20, "FooBar", "FooBar")]
    fn test_canonical_action_names(
        #[case] protocol: OcppProtocol,
        #[case] wire: &str,
        #[case] canonical: &str,
    ) {
        assert_eq!(canonical_action(protocol, wire).unwrap(), canonical);
        assert_eq!(wire_action(protocol, canonical).unwrap(), wire);
    }

    #[test]
    fn test_dialect_gaps_are_unsupported() {
        assert!(matches!(
            wire_action(OcppProtocol::Ocpp20, "GetConfiguration"),
            Err(ConversionError::UnsupportedAction { .. })
        ));
        assert!(matches!(
            canonical_action(OcppProtocol::Ocpp16, "TransactionEvent"),
            Err(ConversionError::UnsupportedAction { .. })
        ));
        assert!(matches!(
            canonical_action(OcppProtocol::Ocpp20, "RemoteStartTransaction"),
            Err(ConversionError::UnsupportedAction { .. })
        ));
    }

    #[test]
    fn test_classification() {
        assert!(is_outbound_command("GetConfiguration"));
        assert!(is_outbound_command("DataTransfer"));
        assert!(is_outbound_command("VendorSpecificThing"));
        assert!(!is_outbound_command("BootNotification"));
    }

    #[test]
    fn test_default_registry_has_every_family() {
        let registry = default_registry();
        assert_eq!(registry.len(), 3);
        for (protocol, adapter) in &registry {
            assert_eq!(*protocol, adapter.protocol());
        }
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(
            ConversionError::invalid("Authorize", "missing idTag").error_code(),
            ErrorCode::FormationViolation
        );
        assert_eq!(
            ConversionError::NotACall(MessageType::CallResult).error_code(),
            ErrorCode::ProtocolError
        );
    }
}
