//! Payload shaping shared by the 2.0(.1) and 2.1 adapters
//!
//! Nested 2.x objects (`chargingStation`, `idToken`, `transactionInfo`, `evse`,
//! `unitOfMeasure`) are flattened into the canonical shapes and rebuilt on the
//! way out.

use serde_json::Value;
use std::sync::atomic::{AtomicI64, Ordering};
use tracing::debug;

use super::{reshape, ConversionError};
use crate::ocpp::canonical as c;
use crate::ocpp::messages_v2 as m;

/// Token type used when a canonical id tag carries none.
const DEFAULT_TOKEN_TYPE: &str = "Central";

static NEXT_REMOTE_START_ID: AtomicI64 = AtomicI64::new(1);

fn id_token(id_tag: String, token_type: Option<String>) -> m::IdToken {
    m::IdToken {
        id_token: id_tag,
        token_type: token_type.unwrap_or_else(|| DEFAULT_TOKEN_TYPE.to_string()),
    }
}

pub(crate) fn request_to_canonical(action: &str, payload: Value) -> Result<Value, ConversionError> {
    match action {
        "BootNotification" => reshape(action, payload, |w: m::BootNotificationRequest| {
            let station = w.charging_station;
            let (iccid, imsi) = station
                .modem
                .map(|modem| (modem.iccid, modem.imsi))
                .unwrap_or((None, None));
            Ok(c::BootNotification {
                vendor: station.vendor_name,
                model: station.model,
                serial_number: station.serial_number,
                charge_box_serial_number: None,
                firmware_version: station.firmware_version,
                iccid,
                imsi,
                meter_type: None,
                meter_serial_number: None,
                reason: Some(w.reason),
            })
        }),
        "Authorize" => reshape(action, payload, |w: m::AuthorizeRequest| {
            Ok(c::Authorize {
                id_tag: w.id_token.id_token,
                id_token_type: Some(w.id_token.token_type),
            })
        }),
        "TransactionEvent" => reshape(action, payload, |w: m::TransactionEventRequest| {
            let (id_tag, id_token_type) = match w.id_token {
                Some(t) => (Some(t.id_token), Some(t.token_type)),
                None => (None, None),
            };
            Ok(c::TransactionEvent {
                event_type: w.event_type,
                timestamp: w.timestamp,
                trigger_reason: w.trigger_reason,
                seq_no: w.seq_no,
                transaction_id: w.transaction_info.transaction_id,
                charging_state: w.transaction_info.charging_state,
                stopped_reason: w.transaction_info.stopped_reason,
                remote_start_id: w.transaction_info.remote_start_id,
                offline: w.offline,
                evse_id: w.evse.as_ref().map(|e| e.id),
                connector_id: w.evse.and_then(|e| e.connector_id),
                id_tag,
                id_token_type,
                meter_value: w.meter_value.map(meter_values_to_canonical),
            })
        }),
        "MeterValues" => reshape(action, payload, |w: m::MeterValuesRequest| {
            Ok(c::MeterValues {
                connector_id: w.evse_id,
                transaction_id: None,
                meter_value: meter_values_to_canonical(w.meter_value),
            })
        }),
        "StatusNotification" => reshape(action, payload, |w: m::StatusNotificationRequest| {
            Ok(c::StatusNotification {
                connector_id: w.connector_id,
                evse_id: Some(w.evse_id),
                status: status_to_canonical(w.connector_status),
                error_code: None,
                timestamp: Some(w.timestamp),
                info: None,
                vendor_id: None,
                vendor_error_code: None,
            })
        }),
        "RemoteStartTransaction" => {
            reshape(action, payload, |w: m::RequestStartTransactionRequest| {
                Ok(c::RemoteStart {
                    id_tag: w.id_token.id_token,
                    id_token_type: Some(w.id_token.token_type),
                    connector_id: w.evse_id,
                    remote_start_id: Some(w.remote_start_id),
                    charging_profile: w.charging_profile,
                })
            })
        }
        "RemoteStopTransaction" => {
            reshape(action, payload, |w: m::RequestStopTransactionRequest| {
                Ok(c::RemoteStop {
                    transaction_id: w.transaction_id,
                })
            })
        }
        _ => Ok(payload),
    }
}

pub(crate) fn request_from_canonical(action: &str, payload: Value) -> Result<Value, ConversionError> {
    match action {
        "BootNotification" => reshape(action, payload, |b: c::BootNotification| {
            let modem = (b.iccid.is_some() || b.imsi.is_some()).then(|| m::Modem {
                iccid: b.iccid,
                imsi: b.imsi,
            });
            Ok(m::BootNotificationRequest {
                charging_station: m::ChargingStation {
                    model: b.model,
                    vendor_name: b.vendor,
                    serial_number: b.serial_number,
                    firmware_version: b.firmware_version,
                    modem,
                },
                reason: b.reason.unwrap_or_else(|| "PowerUp".to_string()),
            })
        }),
        "Authorize" => reshape(action, payload, |a: c::Authorize| {
            Ok(m::AuthorizeRequest {
                id_token: id_token(a.id_tag, a.id_token_type),
                certificate: None,
            })
        }),
        "TransactionEvent" => reshape(action, payload, |t: c::TransactionEvent| {
            let id_token = t.id_tag.map(|tag| id_token(tag, t.id_token_type));
            Ok(m::TransactionEventRequest {
                event_type: t.event_type,
                timestamp: t.timestamp,
                trigger_reason: t.trigger_reason,
                seq_no: t.seq_no,
                transaction_info: m::TransactionInfo {
                    transaction_id: t.transaction_id,
                    charging_state: t.charging_state,
                    stopped_reason: t.stopped_reason,
                    remote_start_id: t.remote_start_id,
                },
                offline: t.offline,
                id_token,
                evse: t.evse_id.map(|id| m::Evse {
                    id,
                    connector_id: t.connector_id,
                }),
                meter_value: t.meter_value.map(meter_values_from_canonical),
            })
        }),
        "MeterValues" => reshape(action, payload, |mv: c::MeterValues| {
            Ok(m::MeterValuesRequest {
                evse_id: mv.connector_id,
                meter_value: meter_values_from_canonical(mv.meter_value),
            })
        }),
        "StatusNotification" => reshape(action, payload, |s: c::StatusNotification| {
            Ok(m::StatusNotificationRequest {
                timestamp: s.timestamp.unwrap_or_else(chrono::Utc::now),
                connector_status: status_from_canonical(s.status),
                evse_id: s.evse_id.unwrap_or(s.connector_id),
                connector_id: s.connector_id,
            })
        }),
        "RemoteStartTransaction" => reshape(action, payload, |r: c::RemoteStart| {
            Ok(m::RequestStartTransactionRequest {
                id_token: id_token(r.id_tag, r.id_token_type),
                remote_start_id: r
                    .remote_start_id
                    .unwrap_or_else(|| NEXT_REMOTE_START_ID.fetch_add(1, Ordering::Relaxed)),
                evse_id: r.connector_id,
                charging_profile: r.charging_profile,
            })
        }),
        "RemoteStopTransaction" => reshape(action, payload, |r: c::RemoteStop| {
            Ok(m::RequestStopTransactionRequest {
                transaction_id: r.transaction_id,
            })
        }),
        _ => Ok(payload),
    }
}

pub(crate) fn response_to_canonical(action: &str, payload: Value) -> Result<Value, ConversionError> {
    match action {
        "BootNotification" => reshape(action, payload, |w: m::BootNotificationResponse| {
            Ok(c::BootNotificationResult {
                status: w.status,
                current_time: w.current_time,
                interval: w.interval,
            })
        }),
        "Authorize" => reshape(action, payload, |w: m::AuthorizeResponse| {
            Ok(c::AuthorizeResult {
                id_tag_info: id_token_info_to_canonical(w.id_token_info),
            })
        }),
        "TransactionEvent" => reshape(action, payload, |w: m::TransactionEventResponse| {
            Ok(c::TransactionEventResult {
                id_tag_info: w.id_token_info.map(id_token_info_to_canonical),
                total_cost: w.total_cost,
            })
        }),
        "RemoteStartTransaction" => {
            reshape(action, payload, |w: m::RequestStartTransactionResponse| {
                Ok(c::RemoteStartResult {
                    status: request_status_to_canonical(w.status),
                    transaction_id: w.transaction_id,
                })
            })
        }
        "RemoteStopTransaction" => {
            reshape(action, payload, |w: m::RequestStopTransactionResponse| {
                Ok(c::RemoteStopResult {
                    status: request_status_to_canonical(w.status),
                })
            })
        }
        _ => Ok(payload),
    }
}

pub(crate) fn response_from_canonical(action: &str, payload: Value) -> Result<Value, ConversionError> {
    match action {
        "BootNotification" => reshape(action, payload, |r: c::BootNotificationResult| {
            Ok(m::BootNotificationResponse {
                current_time: r.current_time,
                interval: r.interval,
                status: r.status,
            })
        }),
        "Heartbeat" => reshape(action, payload, |r: c::HeartbeatResult| {
            Ok(m::HeartbeatResponse {
                current_time: r.current_time,
            })
        }),
        "Authorize" => reshape(action, payload, |r: c::AuthorizeResult| {
            Ok(m::AuthorizeResponse {
                id_token_info: id_token_info_from_canonical(r.id_tag_info),
            })
        }),
        "TransactionEvent" => reshape(action, payload, |r: c::TransactionEventResult| {
            Ok(m::TransactionEventResponse {
                total_cost: r.total_cost,
                id_token_info: r.id_tag_info.map(id_token_info_from_canonical),
            })
        }),
        "RemoteStartTransaction" => reshape(action, payload, |r: c::RemoteStartResult| {
            Ok(m::RequestStartTransactionResponse {
                status: request_status_from_canonical(r.status),
                transaction_id: r.transaction_id,
            })
        }),
        "RemoteStopTransaction" => reshape(action, payload, |r: c::RemoteStopResult| {
            Ok(m::RequestStopTransactionResponse {
                status: request_status_from_canonical(r.status),
            })
        }),
        _ => Ok(payload),
    }
}

fn meter_values_to_canonical(values: Vec<m::MeterValue>) -> Vec<c::MeterValue> {
    values
        .into_iter()
        .map(|mv| c::MeterValue {
            timestamp: mv.timestamp,
            sampled_value: mv
                .sampled_value
                .into_iter()
                .map(|sv| {
                    let (unit, multiplier) = sv
                        .unit_of_measure
                        .map(|u| (u.unit, u.multiplier.unwrap_or(0)))
                        .unwrap_or((None, 0));
                    c::SampledValue {
                        value: Some(sv.value * 10f64.powi(multiplier)),
                        raw_value: None,
                        format: None,
                        measurand: sv.measurand,
                        unit,
                        phase: sv.phase,
                        context: sv.context,
                        location: sv.location,
                    }
                })
                .collect(),
        })
        .collect()
}

fn meter_values_from_canonical(values: Vec<c::MeterValue>) -> Vec<m::MeterValue> {
    values
        .into_iter()
        .map(|mv| m::MeterValue {
            timestamp: mv.timestamp,
            sampled_value: mv
                .sampled_value
                .into_iter()
                .filter_map(|sv| {
                    let value = sv
                        .value
                        .or_else(|| sv.raw_value.as_deref().and_then(|raw| raw.trim().parse().ok()));
                    let Some(value) = value else {
                        debug!(format = ?sv.format, "sample without a numeric reading dropped");
                        return None;
                    };
                    Some(m::SampledValue {
                        value,
                        context: sv.context,
                        measurand: sv.measurand,
                        phase: sv.phase,
                        location: sv.location,
                        unit_of_measure: sv.unit.map(|unit| m::UnitOfMeasure {
                            unit: Some(unit),
                            multiplier: None,
                        }),
                    })
                })
                .collect(),
        })
        .collect()
}

fn status_to_canonical(status: m::ConnectorStatus) -> c::ConnectorStatus {
    match status {
        m::ConnectorStatus::Available => c::ConnectorStatus::Available,
        m::ConnectorStatus::Occupied => c::ConnectorStatus::Occupied,
        m::ConnectorStatus::Reserved => c::ConnectorStatus::Reserved,
        m::ConnectorStatus::Unavailable => c::ConnectorStatus::Unavailable,
        m::ConnectorStatus::Faulted => c::ConnectorStatus::Faulted,
    }
}

fn status_from_canonical(status: c::ConnectorStatus) -> m::ConnectorStatus {
    use c::ConnectorStatus as S;
    match status {
        S::Available => m::ConnectorStatus::Available,
        S::Preparing | S::Charging | S::SuspendedEVSE | S::SuspendedEV | S::Finishing | S::Occupied => {
            m::ConnectorStatus::Occupied
        }
        S::Reserved => m::ConnectorStatus::Reserved,
        S::Unavailable => m::ConnectorStatus::Unavailable,
        S::Faulted => m::ConnectorStatus::Faulted,
    }
}

fn id_token_info_to_canonical(info: m::IdTokenInfo) -> c::IdTagInfo {
    c::IdTagInfo {
        status: info.status,
        expiry_date: info.cache_expiry_date_time,
        parent_id_tag: info.group_id_token.map(|t| t.id_token),
    }
}

fn id_token_info_from_canonical(info: c::IdTagInfo) -> m::IdTokenInfo {
    m::IdTokenInfo {
        status: info.status,
        cache_expiry_date_time: info.expiry_date,
        group_id_token: info.parent_id_tag.map(|tag| id_token(tag, None)),
    }
}

fn request_status_to_canonical(status: m::RequestStartStopStatus) -> c::RequestStatus {
    match status {
        m::RequestStartStopStatus::Accepted => c::RequestStatus::Accepted,
        m::RequestStartStopStatus::Rejected => c::RequestStatus::Rejected,
    }
}

fn request_status_from_canonical(status: c::RequestStatus) -> m::RequestStartStopStatus {
    match status {
        c::RequestStatus::Accepted => m::RequestStartStopStatus::Accepted,
        c::RequestStatus::Rejected => m::RequestStartStopStatus::Rejected,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_boot_notification_flattens_station_and_modem() {
        let canonical = request_to_canonical(
            "BootNotification",
            json!({
                "reason": "PowerUp",
                "chargingStation": {
                    "model": "X2",
                    "vendorName": "Acme",
                    "modem": {"iccid": "8946", "imsi": "2400"}
                }
            }),
        )
        .unwrap();
        assert_eq!(
            canonical,
            json!({"vendor": "Acme", "model": "X2", "iccid": "8946", "imsi": "2400", "reason": "PowerUp"})
        );
    }

    #[test]
    fn test_unit_multiplier_is_applied() {
        let canonical = request_to_canonical(
            "MeterValues",
            json!({
                "evseId": 1,
                "meterValue": [{
                    "timestamp": "2024-05-01T10:00:00Z",
                    "sampledValue": [{"value": 1.5, "unitOfMeasure": {"unit": "Wh", "multiplier": 3}}]
                }]
            }),
        )
        .unwrap();
        let sampled = &canonical["meterValue"][0]["sampledValue"][0];
        assert_eq!(sampled["value"], 1500.0);
        assert_eq!(sampled["unit"], "Wh");
        assert_eq!(canonical["connectorId"], 1);
    }

    #[test]
    fn test_samples_without_a_reading_are_left_out() {
        let wire = request_from_canonical(
            "MeterValues",
            json!({
                "connectorId": 1,
                "meterValue": [{
                    "timestamp": "2024-05-01T10:00:00Z",
                    "sampledValue": [
                        {"rawValue": "AP//MEUCIQD3", "format": "SignedData"},
                        {"rawValue": "12.5", "format": "Raw", "unit": "kWh"}
                    ]
                }]
            }),
        )
        .unwrap();
        let samples = wire["meterValue"][0]["sampledValue"].as_array().unwrap();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0]["value"], 12.5);
        assert_eq!(samples[0]["unitOfMeasure"]["unit"], "kWh");
    }

    #[test]
    fn test_remote_start_gets_an_id_when_missing() {
        let wire = request_from_canonical(
            "RemoteStartTransaction",
            json!({"idTag": "TAG-1", "connectorId": 2}),
        )
        .unwrap();
        assert!(wire["remoteStartId"].as_i64().is_some());
        assert_eq!(wire["idToken"], json!({"idToken": "TAG-1", "type": "Central"}));
        assert_eq!(wire["evseId"], 2);
    }

    #[test]
    fn test_status_notification_keeps_evse() {
        let canonical = request_to_canonical(
            "StatusNotification",
            json!({"timestamp": "2024-05-01T10:00:00Z", "connectorStatus": "Occupied", "evseId": 1, "connectorId": 2}),
        )
        .unwrap();
        assert_eq!(canonical["status"], "Occupied");
        assert_eq!(canonical["evseId"], 1);
        assert_eq!(canonical["connectorId"], 2);
    }

    #[test]
    fn test_authorize_response_shapes_id_token_info() {
        let wire = response_from_canonical(
            "Authorize",
            json!({"idTagInfo": {"status": "Blocked"}}),
        )
        .unwrap();
        assert_eq!(wire, json!({"idTokenInfo": {"status": "Blocked"}}));
    }
}
