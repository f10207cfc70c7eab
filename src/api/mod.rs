pub mod connections;
pub mod error;
pub mod health;
pub mod response;
pub mod transactions;

use axum::{
    middleware,
    routing::get,
    Router,
};
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, timeout::TimeoutLayer, trace::TraceLayer};
use tracing::warn;

use crate::{auth::route_guard, config::Config, gateway::{self, AppState}};

/// REST surface behind the route guard, plus the charge point WebSocket route.
pub fn router(state: AppState) -> Router {
    let cfg = state.cfg.clone();

    let mut rest = Router::new()
        .route("/health", get(health::health_check))
        .route("/connections", get(connections::list_connections))
        .route(
            "/connections/:charge_point_id",
            get(connections::get_connections).delete(connections::disconnect),
        )
        .route(
            "/connections/:charge_point_id/send",
            axum::routing::post(connections::send_command),
        )
        .route(
            "/connections/:charge_point_id/configuration",
            get(connections::get_configuration),
        )
        .route("/statistics", get(connections::statistics))
        .route("/transactions/:transaction_id", get(transactions::get_transaction))
        .route_layer(middleware::from_fn_with_state(state.guard.clone(), route_guard))
        .with_state(state.clone());

    if let Some(cors) = cors_layer(&cfg) {
        rest = rest.layer(cors);
    }

    let rest = rest.layer(
        ServiceBuilder::new()
            .layer(axum::extract::DefaultBodyLimit::max(1024 * 1024))
            .layer(TimeoutLayer::new(Duration::from_secs(cfg.server.request_timeout_secs))),
    );

    // The socket route stays outside the request timeout; sessions are long lived.
    rest.merge(gateway::ws::router(state))
        .layer(TraceLayer::new_for_http())
}

fn cors_layer(cfg: &Config) -> Option<CorsLayer> {
    if !cfg.server.enable_cors {
        return None;
    }
    use tower_http::cors::AllowOrigin;
    let origin = cfg.server.cors_origin.as_deref().unwrap_or("http://localhost:3000");
    let origin = match origin.parse::<axum::http::HeaderValue>() {
        Ok(origin) => origin,
        Err(e) => {
            warn!(origin, error = %e, "invalid CORS origin; CORS disabled");
            return None;
        }
    };
    Some(
        CorsLayer::new()
            .allow_origin(AllowOrigin::exact(origin))
            .allow_methods([
                axum::http::Method::GET,
                axum::http::Method::POST,
                axum::http::Method::DELETE,
            ])
            .allow_headers([
                axum::http::header::AUTHORIZATION,
                axum::http::header::CONTENT_TYPE,
                axum::http::HeaderName::from_static(crate::auth::GATEWAY_KEY_HEADER),
            ]),
    )
}
