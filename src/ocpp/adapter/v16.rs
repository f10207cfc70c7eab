//! OCPP 1.6J adapter

use serde_json::Value;
use std::str::FromStr;

use super::{reshape, ConversionError, ProtocolAdapter};
use crate::ocpp::canonical as c;
use crate::ocpp::messages as m;
use crate::ocpp::version::OcppProtocol;

#[derive(Debug, Clone, Copy, Default)]
pub struct Ocpp16Adapter;

impl ProtocolAdapter for Ocpp16Adapter {
    fn protocol(&self) -> OcppProtocol {
        OcppProtocol::Ocpp16
    }

    fn request_to_canonical(&self, action: &str, payload: Value) -> Result<Value, ConversionError> {
        match action {
            "BootNotification" => reshape(action, payload, |w: m::BootNotificationRequest| {
                Ok(c::BootNotification {
                    vendor: w.charge_point_vendor,
                    model: w.charge_point_model,
                    serial_number: w.charge_point_serial_number,
                    charge_box_serial_number: w.charge_box_serial_number,
                    firmware_version: w.firmware_version,
                    iccid: w.iccid,
                    imsi: w.imsi,
                    meter_type: w.meter_type,
                    meter_serial_number: w.meter_serial_number,
                    reason: None,
                })
            }),
            "Authorize" => reshape(action, payload, |w: m::AuthorizeRequest| {
                Ok(c::Authorize {
                    id_tag: w.id_tag,
                    id_token_type: None,
                })
            }),
            "StartTransaction" => reshape(action, payload, |w: m::StartTransactionRequest| {
                Ok(c::StartTransaction {
                    connector_id: w.connector_id,
                    id_tag: w.id_tag,
                    meter_start: w.meter_start,
                    timestamp: w.timestamp,
                    reservation_id: w.reservation_id,
                })
            }),
            "StopTransaction" => reshape(action, payload, |w: m::StopTransactionRequest| {
                Ok(c::StopTransaction {
                    transaction_id: w.transaction_id.to_string(),
                    meter_stop: w.meter_stop,
                    timestamp: w.timestamp,
                    id_tag: w.id_tag,
                    reason: w.reason,
                    transaction_data: w
                        .transaction_data
                        .map(|mv| meter_values_to_canonical(action, mv))
                        .transpose()?,
                })
            }),
            "MeterValues" => reshape(action, payload, |w: m::MeterValuesRequest| {
                Ok(c::MeterValues {
                    connector_id: w.connector_id,
                    transaction_id: w.transaction_id.map(|id| id.to_string()),
                    meter_value: meter_values_to_canonical(action, w.meter_value)?,
                })
            }),
            "StatusNotification" => reshape(action, payload, |w: m::StatusNotificationRequest| {
                Ok(c::StatusNotification {
                    connector_id: w.connector_id,
                    evse_id: None,
                    status: status_to_canonical(w.status),
                    error_code: Some(w.error_code.as_ref().to_string()),
                    timestamp: w.timestamp,
                    info: w.info,
                    vendor_id: w.vendor_id,
                    vendor_error_code: w.vendor_error_code,
                })
            }),
            "RemoteStartTransaction" => {
                reshape(action, payload, |w: m::RemoteStartTransactionRequest| {
                    Ok(c::RemoteStart {
                        id_tag: w.id_tag,
                        id_token_type: None,
                        connector_id: w.connector_id,
                        remote_start_id: None,
                        charging_profile: w
                            .charging_profile
                            .map(|p| serde_json::to_value(p).map_err(|e| ConversionError::invalid(action, e)))
                            .transpose()?,
                    })
                })
            }
            "RemoteStopTransaction" => {
                reshape(action, payload, |w: m::RemoteStopTransactionRequest| {
                    Ok(c::RemoteStop {
                        transaction_id: w.transaction_id.to_string(),
                    })
                })
            }
            _ => Ok(payload),
        }
    }

    fn request_from_canonical(&self, action: &str, payload: Value) -> Result<Value, ConversionError> {
        match action {
            "BootNotification" => reshape(action, payload, |b: c::BootNotification| {
                Ok(m::BootNotificationRequest {
                    charge_point_vendor: b.vendor,
                    charge_point_model: b.model,
                    charge_point_serial_number: b.serial_number,
                    charge_box_serial_number: b.charge_box_serial_number,
                    firmware_version: b.firmware_version,
                    iccid: b.iccid,
                    imsi: b.imsi,
                    meter_type: b.meter_type,
                    meter_serial_number: b.meter_serial_number,
                })
            }),
            "Authorize" => reshape(action, payload, |a: c::Authorize| {
                Ok(m::AuthorizeRequest { id_tag: a.id_tag })
            }),
            "StartTransaction" => reshape(action, payload, |s: c::StartTransaction| {
                Ok(m::StartTransactionRequest {
                    connector_id: s.connector_id,
                    id_tag: s.id_tag,
                    meter_start: s.meter_start,
                    timestamp: s.timestamp,
                    reservation_id: s.reservation_id,
                })
            }),
            "StopTransaction" => reshape(action, payload, |s: c::StopTransaction| {
                Ok(m::StopTransactionRequest {
                    transaction_id: numeric_transaction_id(action, &s.transaction_id)?,
                    meter_stop: s.meter_stop,
                    timestamp: s.timestamp,
                    id_tag: s.id_tag,
                    reason: s.reason,
                    transaction_data: s.transaction_data.map(meter_values_from_canonical),
                })
            }),
            "MeterValues" => reshape(action, payload, |mv: c::MeterValues| {
                Ok(m::MeterValuesRequest {
                    connector_id: mv.connector_id,
                    transaction_id: mv
                        .transaction_id
                        .as_deref()
                        .map(|id| numeric_transaction_id(action, id))
                        .transpose()?,
                    meter_value: meter_values_from_canonical(mv.meter_value),
                })
            }),
            "StatusNotification" => reshape(action, payload, |s: c::StatusNotification| {
                Ok(m::StatusNotificationRequest {
                    connector_id: s.connector_id,
                    error_code: s
                        .error_code
                        .as_deref()
                        .map(|code| {
                            m::ChargePointErrorCode::from_str(code)
                                .unwrap_or(m::ChargePointErrorCode::OtherError)
                        })
                        .unwrap_or(m::ChargePointErrorCode::NoError),
                    status: status_from_canonical(s.status),
                    info: s.info,
                    timestamp: s.timestamp,
                    vendor_id: s.vendor_id,
                    vendor_error_code: s.vendor_error_code,
                })
            }),
            "RemoteStartTransaction" => reshape(action, payload, |r: c::RemoteStart| {
                Ok(m::RemoteStartTransactionRequest {
                    id_tag: r.id_tag,
                    connector_id: r.connector_id,
                    charging_profile: r
                        .charging_profile
                        .map(|p| serde_json::from_value(p).map_err(|e| ConversionError::invalid(action, e)))
                        .transpose()?,
                })
            }),
            "RemoteStopTransaction" => reshape(action, payload, |r: c::RemoteStop| {
                Ok(m::RemoteStopTransactionRequest {
                    transaction_id: numeric_transaction_id(action, &r.transaction_id)?,
                })
            }),
            _ => Ok(payload),
        }
    }

    fn response_to_canonical(&self, action: &str, payload: Value) -> Result<Value, ConversionError> {
        match action {
            "BootNotification" => reshape(action, payload, |w: m::BootNotificationResponse| {
                Ok(c::BootNotificationResult {
                    status: registration_to_canonical(w.status),
                    current_time: w.current_time,
                    interval: w.interval,
                })
            }),
            "Authorize" => reshape(action, payload, |w: m::AuthorizeResponse| {
                Ok(c::AuthorizeResult {
                    id_tag_info: id_tag_info_to_canonical(w.id_tag_info),
                })
            }),
            "StartTransaction" => reshape(action, payload, |w: m::StartTransactionResponse| {
                Ok(c::StartTransactionResult {
                    transaction_id: w.transaction_id.to_string(),
                    id_tag_info: id_tag_info_to_canonical(w.id_tag_info),
                })
            }),
            "StopTransaction" => reshape(action, payload, |w: m::StopTransactionResponse| {
                Ok(c::StopTransactionResult {
                    id_tag_info: w.id_tag_info.map(id_tag_info_to_canonical),
                })
            }),
            "RemoteStartTransaction" => {
                reshape(action, payload, |w: m::RemoteStartTransactionResponse| {
                    Ok(c::RemoteStartResult {
                        status: request_status_to_canonical(w.status),
                        transaction_id: None,
                    })
                })
            }
            "RemoteStopTransaction" => {
                reshape(action, payload, |w: m::RemoteStopTransactionResponse| {
                    Ok(c::RemoteStopResult {
                        status: request_status_to_canonical(w.status),
                    })
                })
            }
            _ => Ok(payload),
        }
    }

    fn response_from_canonical(&self, action: &str, payload: Value) -> Result<Value, ConversionError> {
        match action {
            "BootNotification" => reshape(action, payload, |r: c::BootNotificationResult| {
                Ok(m::BootNotificationResponse {
                    status: registration_from_canonical(r.status),
                    current_time: r.current_time,
                    interval: r.interval,
                })
            }),
            "Heartbeat" => reshape(action, payload, |r: c::HeartbeatResult| {
                Ok(m::HeartbeatResponse {
                    current_time: r.current_time,
                })
            }),
            "Authorize" => reshape(action, payload, |r: c::AuthorizeResult| {
                Ok(m::AuthorizeResponse {
                    id_tag_info: id_tag_info_from_canonical(r.id_tag_info),
                })
            }),
            "StartTransaction" => reshape(action, payload, |r: c::StartTransactionResult| {
                Ok(m::StartTransactionResponse {
                    id_tag_info: id_tag_info_from_canonical(r.id_tag_info),
                    transaction_id: numeric_transaction_id(action, &r.transaction_id)?,
                })
            }),
            "StopTransaction" => reshape(action, payload, |r: c::StopTransactionResult| {
                Ok(m::StopTransactionResponse {
                    id_tag_info: r.id_tag_info.map(id_tag_info_from_canonical),
                })
            }),
            "RemoteStartTransaction" => reshape(action, payload, |r: c::RemoteStartResult| {
                Ok(m::RemoteStartTransactionResponse {
                    status: request_status_from_canonical(r.status),
                })
            }),
            "RemoteStopTransaction" => reshape(action, payload, |r: c::RemoteStopResult| {
                Ok(m::RemoteStopTransactionResponse {
                    status: request_status_from_canonical(r.status),
                })
            }),
            _ => Ok(payload),
        }
    }
}

fn numeric_transaction_id(action: &str, id: &str) -> Result<i32, ConversionError> {
    id.parse()
        .map_err(|_| ConversionError::invalid(action, format!("transactionId {id:?} is not an integer")))
}

/// Raw samples must be decimal; signed samples are carried opaque.
fn meter_values_to_canonical(
    action: &str,
    values: Vec<m::MeterValue>,
) -> Result<Vec<c::MeterValue>, ConversionError> {
    values
        .into_iter()
        .map(|mv| {
            let sampled_value = mv
                .sampled_value
                .into_iter()
                .map(|sv| sampled_value_to_canonical(action, sv))
                .collect::<Result<Vec<_>, ConversionError>>()?;
            Ok(c::MeterValue {
                timestamp: mv.timestamp,
                sampled_value,
            })
        })
        .collect()
}

fn sampled_value_to_canonical(
    action: &str,
    sv: m::SampledValue,
) -> Result<c::SampledValue, ConversionError> {
    let value = match sv.format.as_deref() {
        None | Some("Raw") => Some(sv.value.trim().parse::<f64>().map_err(|_| {
            ConversionError::invalid(action, format!("sampled value {:?} is not numeric", sv.value))
        })?),
        Some(c::SIGNED_DATA_FORMAT) => None,
        Some(other) => {
            return Err(ConversionError::invalid(
                action,
                format!("unknown sampled value format {other:?}"),
            ))
        }
    };
    Ok(c::SampledValue {
        value,
        raw_value: Some(sv.value),
        format: sv.format,
        measurand: sv.measurand,
        unit: sv.unit,
        phase: sv.phase,
        context: sv.context,
        location: sv.location,
    })
}

fn meter_values_from_canonical(values: Vec<c::MeterValue>) -> Vec<m::MeterValue> {
    values
        .into_iter()
        .map(|mv| m::MeterValue {
            timestamp: mv.timestamp,
            sampled_value: mv
                .sampled_value
                .into_iter()
                .map(|sv| m::SampledValue {
                    value: sv
                        .raw_value
                        .or_else(|| sv.value.map(|v| v.to_string()))
                        .unwrap_or_default(),
                    context: sv.context,
                    format: sv.format,
                    measurand: sv.measurand,
                    phase: sv.phase,
                    location: sv.location,
                    unit: sv.unit,
                })
                .collect(),
        })
        .collect()
}

fn status_to_canonical(status: m::ChargePointStatus) -> c::ConnectorStatus {
    use m::ChargePointStatus as S;
    match status {
        S::Available => c::ConnectorStatus::Available,
        S::Preparing => c::ConnectorStatus::Preparing,
        S::Charging => c::ConnectorStatus::Charging,
        S::SuspendedEVSE => c::ConnectorStatus::SuspendedEVSE,
        S::SuspendedEV => c::ConnectorStatus::SuspendedEV,
        S::Finishing => c::ConnectorStatus::Finishing,
        S::Reserved => c::ConnectorStatus::Reserved,
        S::Unavailable => c::ConnectorStatus::Unavailable,
        S::Faulted => c::ConnectorStatus::Faulted,
    }
}

fn status_from_canonical(status: c::ConnectorStatus) -> m::ChargePointStatus {
    use c::ConnectorStatus as S;
    match status {
        S::Available => m::ChargePointStatus::Available,
        S::Preparing => m::ChargePointStatus::Preparing,
        S::Charging | S::Occupied => m::ChargePointStatus::Charging,
        S::SuspendedEVSE => m::ChargePointStatus::SuspendedEVSE,
        S::SuspendedEV => m::ChargePointStatus::SuspendedEV,
        S::Finishing => m::ChargePointStatus::Finishing,
        S::Reserved => m::ChargePointStatus::Reserved,
        S::Unavailable => m::ChargePointStatus::Unavailable,
        S::Faulted => m::ChargePointStatus::Faulted,
    }
}

fn registration_to_canonical(status: m::RegistrationStatus) -> c::RegistrationStatus {
    match status {
        m::RegistrationStatus::Accepted => c::RegistrationStatus::Accepted,
        m::RegistrationStatus::Pending => c::RegistrationStatus::Pending,
        m::RegistrationStatus::Rejected => c::RegistrationStatus::Rejected,
    }
}

fn registration_from_canonical(status: c::RegistrationStatus) -> m::RegistrationStatus {
    match status {
        c::RegistrationStatus::Accepted => m::RegistrationStatus::Accepted,
        c::RegistrationStatus::Pending => m::RegistrationStatus::Pending,
        c::RegistrationStatus::Rejected => m::RegistrationStatus::Rejected,
    }
}

fn id_tag_info_to_canonical(info: m::IdTagInfo) -> c::IdTagInfo {
    use m::AuthorizationStatus as S;
    c::IdTagInfo {
        status: match info.status {
            S::Accepted => c::AuthorizationStatus::Accepted,
            S::Blocked => c::AuthorizationStatus::Blocked,
            S::Expired => c::AuthorizationStatus::Expired,
            S::Invalid => c::AuthorizationStatus::Invalid,
            S::ConcurrentTx => c::AuthorizationStatus::ConcurrentTx,
        },
        expiry_date: info.expiry_date,
        parent_id_tag: info.parent_id_tag,
    }
}

/// 2.x-only outcomes have no 1.6 spelling and are reported as `Invalid`.
fn id_tag_info_from_canonical(info: c::IdTagInfo) -> m::IdTagInfo {
    use c::AuthorizationStatus as S;
    m::IdTagInfo {
        status: match info.status {
            S::Accepted => m::AuthorizationStatus::Accepted,
            S::Blocked => m::AuthorizationStatus::Blocked,
            S::Expired => m::AuthorizationStatus::Expired,
            S::ConcurrentTx => m::AuthorizationStatus::ConcurrentTx,
            S::Invalid
            | S::NoCredit
            | S::NotAllowedTypeEVSE
            | S::NotAtThisLocation
            | S::NotAtThisTime
            | S::Unknown => m::AuthorizationStatus::Invalid,
        },
        expiry_date: info.expiry_date,
        parent_id_tag: info.parent_id_tag,
    }
}

fn request_status_to_canonical(status: m::RemoteStartStopStatus) -> c::RequestStatus {
    match status {
        m::RemoteStartStopStatus::Accepted => c::RequestStatus::Accepted,
        m::RemoteStartStopStatus::Rejected => c::RequestStatus::Rejected,
    }
}

fn request_status_from_canonical(status: c::RequestStatus) -> m::RemoteStartStopStatus {
    match status {
        c::RequestStatus::Accepted => m::RemoteStartStopStatus::Accepted,
        c::RequestStatus::Rejected => m::RemoteStartStopStatus::Rejected,
    }
}
