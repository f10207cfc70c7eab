//! Baseline charge point initiated actions
//!
//! Handlers work on canonical payloads only. A business rejection (blocked
//! tag, unknown transaction) is still a normal reply.

use anyhow::{Context, Result};
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::canonical as c;
use super::dispatcher::{ActionDispatcher, ActionHandler, CallContext};
use crate::domain::{AuthorizationService, NewTransaction, TransactionService};
use crate::gateway::connection::{ConnectionManager, ConnectionStatus};

fn parse<T: DeserializeOwned>(action: &str, payload: Value) -> Result<T> {
    serde_json::from_value(payload).with_context(|| format!("malformed canonical {action} payload"))
}

fn to_value<T: Serialize>(value: &T) -> Result<Value> {
    Ok(serde_json::to_value(value)?)
}

/// Shared collaborators for the baseline handlers.
#[derive(Clone)]
pub struct BaselineHandlers {
    pub connections: Arc<ConnectionManager>,
    pub authorization: Arc<dyn AuthorizationService>,
    pub transactions: Arc<dyn TransactionService>,
    pub heartbeat_interval_secs: i32,
}

impl BaselineHandlers {
    /// Register every baseline action on `dispatcher`.
    pub fn register(self, dispatcher: &mut ActionDispatcher) {
        let this = Arc::new(self);
        let actions: [(&str, Arc<dyn ActionHandler>); 9] = [
            ("BootNotification", Arc::new(BootNotificationHandler(this.clone()))),
            ("Heartbeat", Arc::new(HeartbeatHandler)),
            ("Authorize", Arc::new(AuthorizeHandler(this.clone()))),
            ("StartTransaction", Arc::new(StartTransactionHandler(this.clone()))),
            ("StopTransaction", Arc::new(StopTransactionHandler(this.clone()))),
            ("TransactionEvent", Arc::new(TransactionEventHandler(this.clone()))),
            ("StatusNotification", Arc::new(StatusNotificationHandler(this.clone()))),
            ("MeterValues", Arc::new(MeterValuesHandler)),
            ("DataTransfer", Arc::new(DataTransferHandler)),
        ];
        for (action, handler) in actions {
            dispatcher.register(action, handler);
        }
    }
}

struct BootNotificationHandler(Arc<BaselineHandlers>);

#[async_trait::async_trait]
impl ActionHandler for BootNotificationHandler {
    async fn handle(&self, ctx: &CallContext, payload: Value) -> Result<Value> {
        let boot: c::BootNotification = parse("BootNotification", payload)?;
        info!(
            charge_point_id = %ctx.charge_point_id,
            vendor = %boot.vendor,
            model = %boot.model,
            firmware = boot.firmware_version.as_deref().unwrap_or("-"),
            "boot notification"
        );
        self.0
            .connections
            .set_status(ctx.connection_id, ConnectionStatus::Available);
        to_value(&c::BootNotificationResult {
            status: c::RegistrationStatus::Accepted,
            current_time: Utc::now(),
            interval: self.0.heartbeat_interval_secs,
        })
    }
}

struct HeartbeatHandler;

#[async_trait::async_trait]
impl ActionHandler for HeartbeatHandler {
    async fn handle(&self, _ctx: &CallContext, _payload: Value) -> Result<Value> {
        to_value(&c::HeartbeatResult {
            current_time: Utc::now(),
        })
    }
}

struct AuthorizeHandler(Arc<BaselineHandlers>);

#[async_trait::async_trait]
impl ActionHandler for AuthorizeHandler {
    async fn handle(&self, ctx: &CallContext, payload: Value) -> Result<Value> {
        let request: c::Authorize = parse("Authorize", payload)?;
        let id_tag_info = self.0.authorization.authorize(&request.id_tag).await?;
        debug!(
            charge_point_id = %ctx.charge_point_id,
            id_tag = %request.id_tag,
            status = ?id_tag_info.status,
            "authorize"
        );
        to_value(&c::AuthorizeResult { id_tag_info })
    }
}

struct StartTransactionHandler(Arc<BaselineHandlers>);

#[async_trait::async_trait]
impl ActionHandler for StartTransactionHandler {
    async fn handle(&self, ctx: &CallContext, payload: Value) -> Result<Value> {
        let request: c::StartTransaction = parse("StartTransaction", payload)?;
        let id_tag_info = self.0.authorization.authorize(&request.id_tag).await?;

        // 1.6 requires a transaction id even when the tag is refused.
        let tx = self
            .0
            .transactions
            .start(NewTransaction {
                charge_point_id: ctx.charge_point_id.clone(),
                connector_id: Some(request.connector_id),
                id_tag: Some(request.id_tag.clone()),
                meter_start: Some(request.meter_start),
                started_at: request.timestamp,
            })
            .await?;
        if id_tag_info.status != c::AuthorizationStatus::Accepted {
            self.0
                .transactions
                .stop(&tx.transaction_id, Some(request.meter_start), Utc::now(), Some("DeAuthorized".into()))
                .await?;
        }

        info!(
            charge_point_id = %ctx.charge_point_id,
            transaction_id = %tx.transaction_id,
            connector_id = request.connector_id,
            status = ?id_tag_info.status,
            "transaction started"
        );
        to_value(&c::StartTransactionResult {
            transaction_id: tx.transaction_id,
            id_tag_info,
        })
    }
}

struct StopTransactionHandler(Arc<BaselineHandlers>);

#[async_trait::async_trait]
impl ActionHandler for StopTransactionHandler {
    async fn handle(&self, ctx: &CallContext, payload: Value) -> Result<Value> {
        let request: c::StopTransaction = parse("StopTransaction", payload)?;
        match self
            .0
            .transactions
            .stop(
                &request.transaction_id,
                Some(request.meter_stop),
                request.timestamp,
                request.reason.clone(),
            )
            .await
        {
            Ok(tx) => info!(
                charge_point_id = %ctx.charge_point_id,
                transaction_id = %tx.transaction_id,
                meter_stop = request.meter_stop,
                "transaction stopped"
            ),
            Err(e) => warn!(
                charge_point_id = %ctx.charge_point_id,
                transaction_id = %request.transaction_id,
                error = %e,
                "stop for unknown transaction"
            ),
        }

        let id_tag_info = match &request.id_tag {
            Some(tag) => Some(self.0.authorization.authorize(tag).await?),
            None => None,
        };
        to_value(&c::StopTransactionResult { id_tag_info })
    }
}

struct TransactionEventHandler(Arc<BaselineHandlers>);

#[async_trait::async_trait]
impl ActionHandler for TransactionEventHandler {
    async fn handle(&self, ctx: &CallContext, payload: Value) -> Result<Value> {
        let event: c::TransactionEvent = parse("TransactionEvent", payload)?;
        let transactions = &self.0.transactions;

        transactions
            .track(
                event.transaction_id.clone(),
                NewTransaction {
                    charge_point_id: ctx.charge_point_id.clone(),
                    connector_id: event.evse_id,
                    id_tag: event.id_tag.clone(),
                    meter_start: None,
                    started_at: event.timestamp,
                },
            )
            .await?;
        if event.event_type == c::TransactionEventType::Ended {
            transactions
                .stop(&event.transaction_id, None, event.timestamp, event.stopped_reason.clone())
                .await?;
        }
        debug!(
            charge_point_id = %ctx.charge_point_id,
            transaction_id = %event.transaction_id,
            event_type = ?event.event_type,
            seq_no = event.seq_no,
            "transaction event"
        );

        let id_tag_info = match &event.id_tag {
            Some(tag) => Some(self.0.authorization.authorize(tag).await?),
            None => None,
        };
        to_value(&c::TransactionEventResult {
            id_tag_info,
            total_cost: None,
        })
    }
}

struct StatusNotificationHandler(Arc<BaselineHandlers>);

#[async_trait::async_trait]
impl ActionHandler for StatusNotificationHandler {
    async fn handle(&self, ctx: &CallContext, payload: Value) -> Result<Value> {
        let notification: c::StatusNotification = parse("StatusNotification", payload)?;
        debug!(
            charge_point_id = %ctx.charge_point_id,
            connector_id = notification.connector_id,
            status = ?notification.status,
            "status notification"
        );
        self.0
            .connections
            .set_status(ctx.connection_id, notification.status.into());
        Ok(json!({}))
    }
}

struct MeterValuesHandler;

#[async_trait::async_trait]
impl ActionHandler for MeterValuesHandler {
    async fn handle(&self, ctx: &CallContext, payload: Value) -> Result<Value> {
        let values: c::MeterValues = parse("MeterValues", payload)?;
        let samples: usize = values.meter_value.iter().map(|mv| mv.sampled_value.len()).sum();
        debug!(
            charge_point_id = %ctx.charge_point_id,
            connector_id = values.connector_id,
            samples,
            "meter values"
        );
        Ok(json!({}))
    }
}

struct DataTransferHandler;

#[async_trait::async_trait]
impl ActionHandler for DataTransferHandler {
    async fn handle(&self, ctx: &CallContext, payload: Value) -> Result<Value> {
        let vendor_id = payload
            .get("vendorId")
            .and_then(serde_json::Value::as_str)
            .unwrap_or("-");
        debug!(charge_point_id = %ctx.charge_point_id, vendor_id, "data transfer");
        Ok(json!({ "status": "UnknownVendorId" }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{InMemoryTransactionStore, MockAuthorizationService, MockTransactionService};
    use crate::gateway::connection::Transport;
    use crate::ocpp::manager::ProtocolAdapterManager;
    use crate::ocpp::version::{OcppProtocol, VersionNegotiator};
    use crate::ocpp::wire::{Call, ErrorCode, OcppMessage};
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    struct Fixture {
        dispatcher: ActionDispatcher,
        connections: Arc<ConnectionManager>,
        ctx: CallContext,
        _rx: mpsc::Receiver<String>,
    }

    fn fixture(
        subprotocol: &str,
        authorization: Arc<dyn AuthorizationService>,
        transactions: Arc<dyn TransactionService>,
    ) -> Fixture {
        let connections = Arc::new(ConnectionManager::new());
        let (tx, rx) = mpsc::channel(4);
        let version = VersionNegotiator.version_info(subprotocol).unwrap();
        let conn = connections.register("CP-1", Transport::new(tx, CancellationToken::new()), version);

        let mut dispatcher = ActionDispatcher::new(Arc::new(ProtocolAdapterManager::new(true, None)));
        BaselineHandlers {
            connections: connections.clone(),
            authorization,
            transactions,
            heartbeat_interval_secs: 60,
        }
        .register(&mut dispatcher);

        Fixture {
            dispatcher,
            connections,
            ctx: CallContext {
                connection_id: conn.id,
                charge_point_id: "CP-1".into(),
                protocol: version.protocol,
            },
            _rx: rx,
        }
    }

    fn accepting() -> Arc<dyn AuthorizationService> {
        let mut auth = MockAuthorizationService::new();
        auth.expect_authorize()
            .returning(|_| Ok(c::IdTagInfo::with_status(c::AuthorizationStatus::Accepted)));
        Arc::new(auth)
    }

    async fn send(f: &Fixture, raw: &str) -> Value {
        let OcppMessage::Call(call) = OcppMessage::parse(raw).unwrap() else {
            panic!("fixture frames are CALLs");
        };
        f.dispatcher.handle(&f.ctx, call).await.to_value()
    }

    #[tokio::test]
    async fn test_boot_notification_is_accepted() {
        let f = fixture("ocpp1.6", accepting(), Arc::new(InMemoryTransactionStore::new()));
        let reply = send(
            &f,
            r#"[2,"1","BootNotification",{"chargePointVendor":"Acme","chargePointModel":"X1"}]"#,
        )
        .await;
        assert_eq!(reply[0], 3);
        assert_eq!(reply[1], "1");
        assert_eq!(reply[2]["status"], "Accepted");
        assert_eq!(reply[2]["interval"], 60);
        assert!(reply[2]["currentTime"].as_str().unwrap().contains('T'));
        assert_eq!(
            f.connections.get(f.ctx.connection_id).unwrap().status,
            ConnectionStatus::Available
        );
    }

    #[tokio::test]
    async fn test_blocked_tag_is_a_normal_reply() {
        let mut auth = MockAuthorizationService::new();
        auth.expect_authorize()
            .withf(|tag| tag == "STOLEN")
            .times(1)
            .returning(|_| Ok(c::IdTagInfo::with_status(c::AuthorizationStatus::Blocked)));
        let f = fixture("ocpp1.6", Arc::new(auth), Arc::new(InMemoryTransactionStore::new()));

        let reply = send(&f, r#"[2,"a","Authorize",{"idTag":"STOLEN"}]"#).await;
        assert_eq!(reply, json!([3, "a", {"idTagInfo": {"status": "Blocked"}}]));
    }

    #[tokio::test]
    async fn test_start_and_stop_transaction_on_16() {
        let store = Arc::new(InMemoryTransactionStore::new());
        let f = fixture("ocpp1.6", accepting(), store.clone());

        let started = send(
            &f,
            r#"[2,"s","StartTransaction",{"connectorId":1,"idTag":"TAG-1","meterStart":100,"timestamp":"2024-05-01T10:00:00Z"}]"#,
        )
        .await;
        let tx_id = started[2]["transactionId"].as_i64().expect("1.6 transaction ids are integers");
        assert_eq!(started[2]["idTagInfo"]["status"], "Accepted");
        assert_eq!(store.active_count(), 1);

        let stop = format!(
            r#"[2,"t","StopTransaction",{{"transactionId":{tx_id},"meterStop":900,"timestamp":"2024-05-01T11:00:00Z"}}]"#
        );
        let stopped = send(&f, &stop).await;
        assert_eq!(stopped, json!([3, "t", {}]));
        assert_eq!(store.active_count(), 0);
    }

    #[tokio::test]
    async fn test_transaction_store_failure_is_internal_error() {
        let mut transactions = MockTransactionService::new();
        transactions
            .expect_start()
            .returning(|_| Err(anyhow::anyhow!("store offline")));
        let f = fixture("ocpp1.6", accepting(), Arc::new(transactions));

        let reply = send(
            &f,
            r#"[2,"s","StartTransaction",{"connectorId":1,"idTag":"TAG-1","meterStart":0,"timestamp":"2024-05-01T10:00:00Z"}]"#,
        )
        .await;
        assert_eq!(reply[0], 4);
        assert_eq!(reply[2], ErrorCode::InternalError.as_ref());
        assert_eq!(reply[3], "store offline");
    }

    #[tokio::test]
    async fn test_transaction_event_lifecycle_on_201() {
        let store = Arc::new(InMemoryTransactionStore::new());
        let f = fixture("ocpp2.0.1", accepting(), store.clone());
        assert_eq!(f.ctx.protocol, OcppProtocol::Ocpp20);

        let started = send(
            &f,
            r#"[2,"e1","TransactionEvent",{"eventType":"Started","timestamp":"2024-05-01T10:00:00Z","triggerReason":"Authorized","seqNo":0,"transactionInfo":{"transactionId":"tx-9"},"idToken":{"idToken":"TAG-1","type":"ISO14443"},"evse":{"id":1,"connectorId":1}}]"#,
        )
        .await;
        assert_eq!(started[2]["idTokenInfo"]["status"], "Accepted");
        assert_eq!(store.active_count(), 1);

        let ended = send(
            &f,
            r#"[2,"e2","TransactionEvent",{"eventType":"Ended","timestamp":"2024-05-01T11:00:00Z","triggerReason":"EVDeparted","seqNo":1,"transactionInfo":{"transactionId":"tx-9","stoppedReason":"EVDisconnected"}}]"#,
        )
        .await;
        assert_eq!(ended, json!([3, "e2", {}]));
        assert_eq!(store.active_count(), 0);
    }

    #[tokio::test]
    async fn test_status_notification_updates_connection() {
        let f = fixture("ocpp1.6", accepting(), Arc::new(InMemoryTransactionStore::new()));
        let reply = send(
            &f,
            r#"[2,"n","StatusNotification",{"connectorId":1,"errorCode":"NoError","status":"Charging"}]"#,
        )
        .await;
        assert_eq!(reply, json!([3, "n", {}]));
        assert_eq!(
            f.connections.get(f.ctx.connection_id).unwrap().status,
            ConnectionStatus::Occupied
        );

        send(
            &f,
            r#"[2,"m","StatusNotification",{"connectorId":1,"errorCode":"GroundFailure","status":"Faulted"}]"#,
        )
        .await;
        assert_eq!(
            f.connections.get(f.ctx.connection_id).unwrap().status,
            ConnectionStatus::Faulted
        );
    }

    #[tokio::test]
    async fn test_heartbeat_on_21() {
        let f = fixture("ocpp2.1", accepting(), Arc::new(InMemoryTransactionStore::new()));
        let reply = send(&f, r#"[2,"h","Heartbeat",{}]"#).await;
        assert_eq!(reply[0], 3);
        assert!(reply[2]["currentTime"].is_string());
    }

    #[tokio::test]
    async fn test_signed_meter_values_are_acknowledged() {
        let f = fixture("ocpp1.6", accepting(), Arc::new(InMemoryTransactionStore::new()));
        let reply = send(
            &f,
            r#"[2,"mv","MeterValues",{"connectorId":1,"meterValue":[{"timestamp":"2024-05-01T10:00:00Z","sampledValue":[{"value":"AP//MEUCIQD3","format":"SignedData"},{"value":"12.0"}]}]}]"#,
        )
        .await;
        assert_eq!(reply, json!([3, "mv", {}]));
    }

    #[tokio::test]
    async fn test_data_transfer_answers_unknown_vendor() {
        let f = fixture("ocpp1.6", accepting(), Arc::new(InMemoryTransactionStore::new()));
        let reply = send(&f, r#"[2,"d","DataTransfer",{"vendorId":"com.acme","data":"x"}]"#).await;
        assert_eq!(reply, json!([3, "d", {"status": "UnknownVendorId"}]));
    }

    #[tokio::test]
    async fn test_unknown_action_after_baseline_registration() {
        let f = fixture("ocpp1.6", accepting(), Arc::new(InMemoryTransactionStore::new()));
        let call = Call {
            message_id: "77".into(),
            action: "FooBar".into(),
            payload: json!({}),
        };
        let reply = f.dispatcher.handle(&f.ctx, call).await.to_value();
        assert_eq!(reply[0], 4);
        assert_eq!(reply[1], "77");
        assert_eq!(reply[2], "NotImplemented");
    }
}
