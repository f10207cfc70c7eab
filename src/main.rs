use anyhow::Result;
use ocpp_gateway::{api, config, gateway, telemetry};
use config::Config;
use telemetry::init_tracing;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    init_tracing();

    let cfg = Config::load()?;

    if cfg.auth.bypass {
        warn!("REST authentication bypass is enabled - never run this way outside local development!");
    } else if cfg.auth.gateway_key_is_unset() {
        anyhow::bail!(
            "SECURITY ERROR: OCPP_GW__AUTH__GATEWAY_API_KEY must be set to a secure random key (min 32 chars). \
            Generate one with: openssl rand -base64 32"
        );
    }

    if cfg.auth.gateway_api_key == "devkey" {
        warn!("Using 'devkey' gateway key - this is only safe for local development!");
    }

    let addr = cfg.server.socket_addr()?;
    if cfg.server.host == "0.0.0.0" {
        warn!(
            "WARNING: Server binding to 0.0.0.0 - service will be accessible from network! \
            For production, bind to 127.0.0.1 unless behind a firewall/reverse proxy."
        );
    }

    let ws_path = cfg.ocpp.path.clone();
    let (state, events) = gateway::AppState::new(cfg)?;
    let app = api::router(state.clone());

    let shutdown = CancellationToken::new();
    gateway::spawn_gateway_tasks(state, events, shutdown.clone());

    info!(%addr, ws_path, "starting OCPP gateway");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            telemetry::shutdown_signal().await;
            shutdown.cancel();
        })
        .await?;

    warn!("shutdown complete");
    Ok(())
}
