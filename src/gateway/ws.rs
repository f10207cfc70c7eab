//! WebSocket upgrade for charge points: `{ocpp.path}/{chargePointId}`.

use axum::{
    extract::{ws::WebSocketUpgrade, State},
    http::{header, HeaderMap, Uri},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use tracing::{info, warn};

use super::session::run_session;
use super::AppState;
use crate::api::error::ApiError;
use crate::ocpp::version::parse_protocol_header;

pub fn router(state: AppState) -> Router {
    let path = state.cfg.ocpp.path.trim_end_matches('/').to_string();
    Router::new()
        .route(&path, get(ocpp_upgrade))
        .route(&format!("{path}/*rest"), get(ocpp_upgrade))
        .with_state(state)
}

/// Charge point identity: the last segment below the mount path.
pub fn charge_point_identity<'a>(mount: &str, path: &'a str) -> Option<&'a str> {
    let rest = path.strip_prefix(mount.trim_end_matches('/'))?;
    let id = rest.trim_start_matches('/').rsplit('/').next()?;
    (!id.is_empty()).then_some(id)
}

async fn ocpp_upgrade(
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    let Some(charge_point_id) = charge_point_identity(&state.cfg.ocpp.path, uri.path()) else {
        warn!(path = %uri.path(), "upgrade refused: no charge point identity");
        return ApiError::BadRequest("charge point identity missing from path".into()).into_response();
    };
    let charge_point_id = charge_point_id.to_string();

    let offered = headers
        .get(header::SEC_WEBSOCKET_PROTOCOL)
        .and_then(|v| v.to_str().ok())
        .map(parse_protocol_header)
        .unwrap_or_default();
    let Some(version) = state.negotiator.negotiate(&offered) else {
        warn!(%charge_point_id, ?offered, "upgrade refused: no supported OCPP subprotocol");
        return ApiError::BadRequest(format!(
            "no supported subprotocol; expected one of {}",
            state.negotiator.supported_subprotocols().join(", ")
        ))
        .into_response();
    };

    info!(
        %charge_point_id,
        subprotocol = version.subprotocol,
        protocol = %version.protocol,
        "negotiated OCPP version"
    );
    let max = state.cfg.ocpp.max_message_bytes;
    ws.protocols([version.subprotocol])
        .max_message_size(max)
        .max_frame_size(max)
        .on_upgrade(move |socket| run_session(state, socket, charge_point_id, version))
}
