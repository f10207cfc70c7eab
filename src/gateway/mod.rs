//! Charge point runtime: shared state, live connections and background tasks.

pub mod connection;
pub mod correlation;
pub mod session;
pub mod ws;

use anyhow::Result;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::auth::{identity_from_config, GatewayRouteGuard, IdentityVerifier};
use crate::config::Config;
use crate::domain::{InMemoryTransactionStore, StaticAuthorizationService, TransactionService};
use crate::ocpp::handlers::BaselineHandlers;
use crate::ocpp::{ActionDispatcher, AdapterEvent, ProtocolAdapterManager, VersionNegotiator};

pub use connection::{ChargePointConnection, ConnectionManager, ConnectionStatus};
pub use correlation::{CorrelatedRequestClient, CorrelationError};

#[derive(Clone)]
pub struct AppState {
    pub cfg: Arc<Config>,
    pub negotiator: VersionNegotiator,
    pub adapters: Arc<ProtocolAdapterManager>,
    pub dispatcher: Arc<ActionDispatcher>,
    pub connections: Arc<ConnectionManager>,
    pub requests: Arc<CorrelatedRequestClient>,
    pub transactions: Arc<dyn TransactionService>,
    pub guard: Arc<GatewayRouteGuard>,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    /// Wire up the gateway. The returned receiver carries adapter events and
    /// must be handed to [`spawn_gateway_tasks`].
    pub fn new(cfg: Config) -> Result<(Self, mpsc::Receiver<AdapterEvent>)> {
        let timeout = std::time::Duration::from_secs(cfg.server.request_timeout_secs.max(1));
        let identity = identity_from_config(&cfg.auth, timeout)?;
        Ok(Self::with_identity(cfg, identity))
    }

    pub fn with_identity(
        cfg: Config,
        identity: Arc<dyn IdentityVerifier>,
    ) -> (Self, mpsc::Receiver<AdapterEvent>) {
        let (events_tx, events_rx) = mpsc::channel(cfg.ocpp.event_buffer.max(1));
        let adapters = Arc::new(ProtocolAdapterManager::new(
            cfg.ocpp.enable_validation,
            Some(events_tx),
        ));
        let connections = Arc::new(ConnectionManager::new());
        let transactions: Arc<dyn TransactionService> = Arc::new(InMemoryTransactionStore::new());

        let mut dispatcher = ActionDispatcher::new(adapters.clone());
        BaselineHandlers {
            connections: connections.clone(),
            authorization: Arc::new(StaticAuthorizationService::from_config(&cfg.authorization)),
            transactions: transactions.clone(),
            heartbeat_interval_secs: cfg.ocpp.heartbeat_interval_secs,
        }
        .register(&mut dispatcher);

        let requests = Arc::new(CorrelatedRequestClient::new(
            adapters.clone(),
            cfg.ocpp.request_timeout(),
        ));
        let guard = Arc::new(GatewayRouteGuard::new(
            cfg.auth.gateway_api_key.clone(),
            cfg.auth.bypass,
            identity,
        ));

        let state = Self {
            cfg: Arc::new(cfg),
            negotiator: VersionNegotiator,
            adapters,
            dispatcher: Arc::new(dispatcher),
            connections,
            requests,
            transactions,
            guard,
            started_at: Utc::now(),
        };
        (state, events_rx)
    }

    /// One stale sweep: evict idle connections and fail their pending calls.
    pub fn sweep_stale(&self) -> usize {
        let evicted = self.connections.evict_stale(self.cfg.ocpp.stale_after_minutes);
        for c in &evicted {
            self.requests.cancel_connection(c.id);
        }
        evicted.len()
    }
}

/// Start the stale sweeper and the adapter event consumer.
pub fn spawn_gateway_tasks(
    state: AppState,
    events: mpsc::Receiver<AdapterEvent>,
    shutdown: CancellationToken,
) {
    let sweeper = state.clone();
    let stop = shutdown.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(sweeper.cfg.ocpp.sweep_interval());
        interval.tick().await;
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = interval.tick() => {
                    let evicted = sweeper.sweep_stale();
                    if evicted > 0 {
                        info!(evicted, remaining = sweeper.connections.len(), "stale sweep");
                    }
                }
            }
        }
        debug!("stale sweeper stopped");
    });

    tokio::spawn(consume_events(events, shutdown));
}

async fn consume_events(mut events: mpsc::Receiver<AdapterEvent>, shutdown: CancellationToken) {
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        match event {
            AdapterEvent::Converted(msg) => debug!(
                charge_point_id = %msg.charge_point_id,
                message_id = %msg.message_id,
                action = %msg.action,
                protocol = %msg.protocol,
                "message converted"
            ),
            AdapterEvent::ConversionFailed {
                charge_point_id,
                protocol,
                message_id,
                error,
            } => warn!(
                %charge_point_id,
                %protocol,
                %message_id,
                %error,
                "message conversion failed"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::connection::Transport;
    use crate::ocpp::version::VersionNegotiator;

    fn state() -> AppState {
        let mut cfg = Config::default();
        cfg.auth.gateway_api_key = "k".into();
        AppState::new(cfg).unwrap().0
    }

    #[tokio::test]
    async fn test_sweep_keeps_fresh_connections() {
        let state = state();
        let (tx, _rx) = mpsc::channel(1);
        let version = VersionNegotiator.version_info("ocpp1.6").unwrap();
        state
            .connections
            .register("CP-1", Transport::new(tx, CancellationToken::new()), version);

        assert_eq!(state.sweep_stale(), 0);
        assert_eq!(state.connections.get_statistics().total_connections, 1);
    }

    #[tokio::test]
    async fn test_sweep_evicts_only_connections_idle_past_threshold() {
        let state = state();
        let version = VersionNegotiator.version_info("ocpp2.0.1").unwrap();
        let (tx1, _rx1) = mpsc::channel(1);
        let (tx2, _rx2) = mpsc::channel(1);
        let stale = state
            .connections
            .register("CP-1", Transport::new(tx1, CancellationToken::new()), version);
        let revived = state
            .connections
            .register("CP-2", Transport::new(tx2, CancellationToken::new()), version);

        let idle = chrono::Duration::minutes(state.cfg.ocpp.stale_after_minutes + 1);
        state.connections.set_last_heartbeat(stale.id, Utc::now() - idle);
        state.connections.set_last_heartbeat(revived.id, Utc::now() - idle);
        state.connections.touch_heartbeat(revived.id);
        assert!(state.connections.get(stale.id).is_some());

        assert_eq!(state.sweep_stale(), 1);
        assert!(state.connections.get(stale.id).is_none());
        assert!(state.connections.get(revived.id).is_some());
        assert_eq!(state.connections.get_statistics().total_connections, 1);
    }

    #[tokio::test]
    async fn test_sweep_fails_pending_calls_of_evicted_connection() {
        let state = state();
        let (tx, mut rx) = mpsc::channel(4);
        let version = VersionNegotiator.version_info("ocpp1.6").unwrap();
        let c = state
            .connections
            .register("CP-1", Transport::new(tx, CancellationToken::new()), version);

        let waiter = {
            let state = state.clone();
            let c = c.clone();
            tokio::spawn(async move {
                state.requests.send_and_wait(&c, "ClearCache", serde_json::json!({}), None).await
            })
        };
        rx.recv().await.unwrap();
        state.connections.set_last_heartbeat(c.id, Utc::now() - chrono::Duration::hours(1));

        assert_eq!(state.sweep_stale(), 1);
        assert_eq!(
            waiter.await.unwrap(),
            Err(crate::gateway::CorrelationError::ConnectionClosed)
        );
    }

    #[tokio::test]
    async fn test_baseline_handlers_are_registered() {
        let state = state();
        for action in ["BootNotification", "Heartbeat", "Authorize", "StartTransaction", "StopTransaction"] {
            assert!(
                state.dispatcher.resolve(crate::ocpp::OcppProtocol::Ocpp16, action).is_some(),
                "{action} missing"
            );
        }
    }
}
