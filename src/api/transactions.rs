use axum::{
    extract::{Path, State},
    Json,
};
use tracing::debug;

use crate::{
    api::{error::ApiError, response::ApiResponse},
    auth::AuthUser,
    domain::Transaction,
    gateway::AppState,
};

/// GET /transactions/:transactionId (end-user session required)
pub async fn get_transaction(
    State(state): State<AppState>,
    user: Option<AuthUser>,
    Path(transaction_id): Path<String>,
) -> Result<Json<ApiResponse<Transaction>>, ApiError> {
    debug!(
        user = user.as_ref().map(|u| u.0.as_str()).unwrap_or("anonymous"),
        %transaction_id,
        "transaction lookup"
    );
    let tx = state
        .transactions
        .get(&transaction_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("transaction {transaction_id}")))?;
    Ok(Json(ApiResponse::success(tx)))
}
