use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::{Duration, Instant};
use tracing::{info, warn};
use uuid::Uuid;
use validator::Validate;

use crate::{
    api::{error::ApiError, response::ApiResponse},
    gateway::{connection::ConnectionStatistics, AppState, ChargePointConnection, CorrelationError},
    ocpp::adapter::is_outbound_command,
};

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct SendCommandRequest {
    #[validate(length(min = 1, max = 64, message = "action must be 1-64 characters"))]
    pub action: String,
    #[serde(default)]
    pub payload: Value,
    #[validate(range(min = 1, max = 300_000, message = "timeoutMs must be within 1..=300000"))]
    pub timeout_ms: Option<u64>,
    pub await_reply: Option<bool>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SendCommandResponse {
    pub charge_point_id: String,
    pub action: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sent_count: Option<usize>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemovedResponse {
    pub charge_point_id: String,
    pub removed: usize,
}

#[derive(Debug, Deserialize)]
pub struct ConfigurationQuery {
    /// Comma separated configuration keys; absent means all.
    pub keys: Option<String>,
}

/// GET /connections
pub async fn list_connections(
    State(state): State<AppState>,
) -> Json<ApiResponse<Vec<ChargePointConnection>>> {
    let connections = state.connections.get_all();
    let total = connections.len();
    Json(ApiResponse::success(connections).with_count(total))
}

/// GET /connections/:chargePointId
pub async fn get_connections(
    State(state): State<AppState>,
    Path(charge_point_id): Path<String>,
) -> Result<Json<ApiResponse<Vec<ChargePointConnection>>>, ApiError> {
    let connections = state.connections.get_by_charge_point_id(&charge_point_id);
    if connections.is_empty() {
        return Err(CorrelationError::NotConnected(charge_point_id).into());
    }
    let total = connections.len();
    Ok(Json(ApiResponse::success(connections).with_count(total)))
}

/// DELETE /connections/:chargePointId
pub async fn disconnect(
    State(state): State<AppState>,
    Path(charge_point_id): Path<String>,
) -> Result<Json<ApiResponse<RemovedResponse>>, ApiError> {
    let mut removed = 0;
    for c in state.connections.get_by_charge_point_id(&charge_point_id) {
        if state.connections.remove(c.id).is_some() {
            state.requests.cancel_connection(c.id);
            removed += 1;
        }
    }
    if removed == 0 {
        return Err(CorrelationError::NotConnected(charge_point_id).into());
    }
    info!(%charge_point_id, removed, "charge point disconnected by operator");
    Ok(Json(ApiResponse::success(RemovedResponse {
        charge_point_id,
        removed,
    })))
}

/// POST /connections/:chargePointId/send
pub async fn send_command(
    State(state): State<AppState>,
    Path(charge_point_id): Path<String>,
    Json(req): Json<SendCommandRequest>,
) -> Result<Json<ApiResponse<SendCommandResponse>>, ApiError> {
    req.validate()?;
    // The REST timeout would drop the handler before a longer wait could finish.
    let rest_timeout_ms = state.cfg.server.request_timeout_secs.saturating_mul(1000);
    if let Some(ms) = req.timeout_ms.filter(|ms| *ms >= rest_timeout_ms) {
        return Err(ApiError::BadRequest(format!(
            "timeoutMs {ms} must be below the {rest_timeout_ms} ms request timeout"
        )));
    }
    if !is_outbound_command(&req.action) {
        return Err(ApiError::BadRequest(format!(
            "{} is not a command the central system can send",
            req.action
        )));
    }
    let payload = match req.payload {
        Value::Null => json!({}),
        other => other,
    };

    if !req.await_reply.unwrap_or(true) {
        if state.connections.get_by_charge_point_id(&charge_point_id).is_empty() {
            return Err(CorrelationError::NotConnected(charge_point_id).into());
        }
        let sent = state.connections.broadcast_with(&charge_point_id, |c| {
            match state.requests.build_call(c, &req.action, payload.clone()) {
                Ok(call) => Some(call.serialize()),
                Err(e) => {
                    warn!(connection_id = %c.id, error = %e, "command skipped for connection");
                    None
                }
            }
        });
        return Ok(Json(ApiResponse::success(SendCommandResponse {
            charge_point_id,
            action: req.action,
            connection_id: None,
            result: None,
            sent_count: Some(sent),
        })));
    }

    let connection = state
        .connections
        .authoritative(&charge_point_id)
        .ok_or_else(|| CorrelationError::NotConnected(charge_point_id.clone()))?;
    let started = Instant::now();
    let result = state
        .requests
        .send_and_wait(
            &connection,
            &req.action,
            payload,
            req.timeout_ms.map(Duration::from_millis),
        )
        .await?;

    Ok(Json(
        ApiResponse::success(SendCommandResponse {
            charge_point_id,
            action: req.action,
            connection_id: Some(connection.id),
            result: Some(result),
            sent_count: None,
        })
        .with_duration(started.elapsed().as_millis() as u64),
    ))
}

/// GET /connections/:chargePointId/configuration
pub async fn get_configuration(
    State(state): State<AppState>,
    Path(charge_point_id): Path<String>,
    Query(query): Query<ConfigurationQuery>,
) -> Result<Json<ApiResponse<Value>>, ApiError> {
    let keys: Vec<String> = query
        .keys
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .map(String::from)
        .collect();
    let connection = state
        .connections
        .authoritative(&charge_point_id)
        .ok_or(CorrelationError::NotConnected(charge_point_id))?;
    let result = state.requests.get_configuration(&connection, &keys).await?;
    Ok(Json(ApiResponse::success(result)))
}

/// GET /statistics
pub async fn statistics(State(state): State<AppState>) -> Json<ApiResponse<ConnectionStatistics>> {
    Json(ApiResponse::success(state.connections.get_statistics()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::gateway::connection::Transport;
    use crate::ocpp::{OcppMessage, VersionNegotiator};
    use axum::http::StatusCode;
    use axum::response::IntoResponse;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    fn state() -> AppState {
        let mut cfg = Config::default();
        cfg.auth.gateway_api_key = "k".into();
        AppState::new(cfg).unwrap().0
    }

    fn connect(state: &AppState, id: &str, subprotocol: &str) -> mpsc::Receiver<String> {
        let (tx, rx) = mpsc::channel(8);
        let version = VersionNegotiator.version_info(subprotocol).unwrap();
        state
            .connections
            .register(id, Transport::new(tx, CancellationToken::new()), version);
        rx
    }

    fn request(action: &str, await_reply: bool) -> SendCommandRequest {
        SendCommandRequest {
            action: action.into(),
            payload: json!({"type": "Soft"}),
            timeout_ms: Some(1_000),
            await_reply: Some(await_reply),
        }
    }

    fn status_of(err: ApiError) -> StatusCode {
        err.into_response().status()
    }

    #[tokio::test]
    async fn test_inbound_only_action_is_rejected() {
        let state = state();
        let _rx = connect(&state, "CP-1", "ocpp1.6");
        let err = send_command(State(state), Path("CP-1".into()), Json(request("BootNotification", true)))
            .await
            .unwrap_err();
        assert_eq!(status_of(err), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_unknown_charge_point_is_not_found() {
        let err = send_command(State(state()), Path("CP-X".into()), Json(request("Reset", true)))
            .await
            .unwrap_err();
        assert_eq!(status_of(err), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_fire_and_forget_reaches_every_connection_in_its_dialect() {
        let state = state();
        let mut old = connect(&state, "CP-1", "ocpp1.6");
        let mut new = connect(&state, "CP-1", "ocpp2.0.1");

        let req = SendCommandRequest {
            action: "RemoteStartTransaction".into(),
            payload: json!({"idTag": "TAG-1", "connectorId": 1}),
            timeout_ms: None,
            await_reply: Some(false),
        };
        let Json(body) = send_command(State(state), Path("CP-1".into()), Json(req))
            .await
            .unwrap();
        assert_eq!(body.data.sent_count, Some(2));

        let v16 = OcppMessage::parse(&old.recv().await.unwrap()).unwrap();
        let v201 = OcppMessage::parse(&new.recv().await.unwrap()).unwrap();
        assert_eq!(v16.action(), Some("RemoteStartTransaction"));
        assert_eq!(v201.action(), Some("RequestStartTransaction"));
    }

    #[tokio::test]
    async fn test_awaited_command_returns_result() {
        let state = state();
        let mut rx = connect(&state, "CP-1", "ocpp1.6");

        let task = tokio::spawn(send_command(
            State(state.clone()),
            Path("CP-1".into()),
            Json(request("Reset", true)),
        ));
        let call = OcppMessage::parse(&rx.recv().await.unwrap()).unwrap();
        let connection = state.connections.authoritative("CP-1").unwrap();
        let reply = OcppMessage::result(call.message_id(), json!({"status": "Accepted"}));
        assert!(state.requests.resolve(connection.id, &reply));

        let Json(body) = task.await.unwrap().unwrap();
        assert_eq!(body.data.result, Some(json!({"status": "Accepted"})));
        assert_eq!(body.data.connection_id, Some(connection.id));
    }

    #[tokio::test]
    async fn test_disconnect_removes_all_sockets() {
        let state = state();
        let _a = connect(&state, "CP-1", "ocpp1.6");
        let _b = connect(&state, "CP-1", "ocpp2.0.1");
        let _c = connect(&state, "CP-2", "ocpp1.6");

        let Json(body) = disconnect(State(state.clone()), Path("CP-1".into())).await.unwrap();
        assert_eq!(body.data.removed, 2);
        assert_eq!(state.connections.len(), 1);

        let err = disconnect(State(state), Path("CP-1".into())).await.unwrap_err();
        assert_eq!(status_of(err), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_wait_longer_than_request_timeout_is_rejected() {
        let state = state();
        let _rx = connect(&state, "CP-1", "ocpp1.6");
        let mut req = request("Reset", true);
        req.timeout_ms = Some(state.cfg.server.request_timeout_secs * 1000);

        let err = send_command(State(state.clone()), Path("CP-1".into()), Json(req))
            .await
            .unwrap_err();
        assert_eq!(status_of(err), StatusCode::BAD_REQUEST);
        assert_eq!(state.requests.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_validation_rejects_empty_action() {
        let err = send_command(State(state()), Path("CP-1".into()), Json(request("", true)))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::ValidationError(_)));
    }
}
