//! OCPP subprotocol negotiation

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};

/// Adapter family a negotiated subprotocol is served by.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, EnumIter,
)]
pub enum OcppProtocol {
    #[serde(rename = "OCPP16")]
    #[strum(serialize = "OCPP16")]
    Ocpp16,
    #[serde(rename = "OCPP20")]
    #[strum(serialize = "OCPP20")]
    Ocpp20,
    #[serde(rename = "OCPP21")]
    #[strum(serialize = "OCPP21")]
    Ocpp21,
}

/// Static description of one supported OCPP version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VersionInfo {
    pub version: &'static str,
    pub subprotocol: &'static str,
    pub protocol: OcppProtocol,
    pub features: &'static [&'static str],
}

const OCPP16_FEATURES: &[&str] = &[
    "RemoteStartTransaction",
    "RemoteStopTransaction",
    "GetConfiguration",
    "ChangeConfiguration",
    "Reset",
    "UnlockConnector",
    "GetDiagnostics",
    "UpdateFirmware",
    "ReserveNow",
    "CancelReservation",
    "StartTransaction",
    "StopTransaction",
    "Authorize",
    "BootNotification",
    "DataTransfer",
    "DiagnosticsStatusNotification",
    "FirmwareStatusNotification",
    "Heartbeat",
    "MeterValues",
    "StatusNotification",
];

const OCPP20_FEATURES: &[&str] = &[
    "RequestStartTransaction",
    "RequestStopTransaction",
    "GetVariables",
    "SetVariables",
    "Reset",
    "UnlockConnector",
    "GetLog",
    "UpdateFirmware",
    "ReserveNow",
    "CancelReservation",
    "TransactionEvent",
    "Authorize",
    "BootNotification",
    "DataTransfer",
    "LogStatusNotification",
    "FirmwareStatusNotification",
    "Heartbeat",
    "NotifyReport",
    "StatusNotification",
    "SecurityEventNotification",
];

const OCPP201_FEATURES: &[&str] = &[
    "RequestStartTransaction",
    "RequestStopTransaction",
    "GetVariables",
    "SetVariables",
    "Reset",
    "UnlockConnector",
    "GetLog",
    "UpdateFirmware",
    "ReserveNow",
    "CancelReservation",
    "TransactionEvent",
    "Authorize",
    "BootNotification",
    "DataTransfer",
    "LogStatusNotification",
    "FirmwareStatusNotification",
    "Heartbeat",
    "NotifyReport",
    "StatusNotification",
    "SecurityEventNotification",
    "Get15118EVCertificate",
    "GetCertificateStatus",
];

const OCPP21_FEATURES: &[&str] = &[
    "RequestStartTransaction",
    "RequestStopTransaction",
    "GetVariables",
    "SetVariables",
    "Reset",
    "UnlockConnector",
    "TransactionEvent",
    "Authorize",
    "BootNotification",
    "DataTransfer",
    "Heartbeat",
    "NotifyReport",
    "StatusNotification",
    "SecurityEventNotification",
    "Get15118EVCertificate",
    "GetCertificateStatus",
    "NotifyAllowedEnergyTransfer",
    "NotifySettlement",
    "CostUpdated",
];

/// Supported versions, newest first. Negotiation walks this order.
pub static SUPPORTED_VERSIONS: &[VersionInfo] = &[
    VersionInfo {
        version: "2.1",
        subprotocol: "ocpp2.1",
        protocol: OcppProtocol::Ocpp21,
        features: OCPP21_FEATURES,
    },
    VersionInfo {
        version: "2.0.1",
        subprotocol: "ocpp2.0.1",
        protocol: OcppProtocol::Ocpp20,
        features: OCPP201_FEATURES,
    },
    VersionInfo {
        version: "2.0",
        subprotocol: "ocpp2.0",
        protocol: OcppProtocol::Ocpp20,
        features: OCPP20_FEATURES,
    },
    VersionInfo {
        version: "1.6",
        subprotocol: "ocpp1.6",
        protocol: OcppProtocol::Ocpp16,
        features: OCPP16_FEATURES,
    },
];

/// Picks the best mutually supported subprotocol. Pure and deterministic.
#[derive(Debug, Clone, Copy, Default)]
pub struct VersionNegotiator;

impl VersionNegotiator {
    pub fn negotiate<S: AsRef<str>>(&self, requested: &[S]) -> Option<&'static VersionInfo> {
        SUPPORTED_VERSIONS.iter().find(|info| {
            requested
                .iter()
                .any(|r| r.as_ref().trim() == info.subprotocol)
        })
    }

    pub fn supported_subprotocols(&self) -> Vec<&'static str> {
        SUPPORTED_VERSIONS.iter().map(|v| v.subprotocol).collect()
    }

    pub fn version_info(&self, subprotocol: &str) -> Option<&'static VersionInfo> {
        SUPPORTED_VERSIONS.iter().find(|v| v.subprotocol == subprotocol)
    }

    pub fn is_supported(&self, subprotocol: &str) -> bool {
        self.version_info(subprotocol).is_some()
    }
}

/// Splits a `Sec-WebSocket-Protocol` header value into its offered tokens.
pub fn parse_protocol_header(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// `ocpp1.6` -> `1.6`. Unknown input is returned unchanged.
pub fn subprotocol_to_version(subprotocol: &str) -> &str {
    SUPPORTED_VERSIONS
        .iter()
        .find(|v| v.subprotocol == subprotocol)
        .map(|v| v.version)
        .unwrap_or(subprotocol)
}

/// `1.6` -> `ocpp1.6`. Unknown input is returned unchanged.
pub fn version_to_subprotocol(version: &str) -> &str {
    SUPPORTED_VERSIONS
        .iter()
        .find(|v| v.version == version)
        .map(|v| v.subprotocol)
        .unwrap_or(version)
}
