//! Inbound CALL dispatch
//!
//! Handlers are registered against canonical action names, either for every
//! protocol or for one protocol family. A protocol-specific registration wins
//! over a generic one. Every CALL produces exactly one reply frame carrying
//! the CALL's message id.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, error, warn};
use uuid::Uuid;

use super::adapter::canonical_action;
use super::manager::ProtocolAdapterManager;
use super::version::OcppProtocol;
use super::wire::{Call, ErrorCode, OcppMessage};

/// Who sent the CALL being handled.
#[derive(Debug, Clone)]
pub struct CallContext {
    pub connection_id: Uuid,
    pub charge_point_id: String,
    pub protocol: OcppProtocol,
}

/// Business logic for one canonical action. Input and output are canonical payloads.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    async fn handle(&self, ctx: &CallContext, payload: Value) -> anyhow::Result<Value>;
}

#[async_trait]
impl<F, Fut> ActionHandler for F
where
    F: Fn(CallContext, Value) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Value>> + Send,
{
    async fn handle(&self, ctx: &CallContext, payload: Value) -> anyhow::Result<Value> {
        (self)(ctx.clone(), payload).await
    }
}

pub struct ActionDispatcher {
    manager: Arc<ProtocolAdapterManager>,
    generic: HashMap<String, Arc<dyn ActionHandler>>,
    per_protocol: HashMap<(OcppProtocol, String), Arc<dyn ActionHandler>>,
}

impl ActionDispatcher {
    pub fn new(manager: Arc<ProtocolAdapterManager>) -> Self {
        Self {
            manager,
            generic: HashMap::new(),
            per_protocol: HashMap::new(),
        }
    }

    pub fn manager(&self) -> &Arc<ProtocolAdapterManager> {
        &self.manager
    }

    /// Register a handler for every protocol.
    pub fn register(&mut self, action: impl Into<String>, handler: Arc<dyn ActionHandler>) {
        self.generic.insert(action.into(), handler);
    }

    /// Register a handler for a single protocol family.
    pub fn register_for(
        &mut self,
        protocol: OcppProtocol,
        action: impl Into<String>,
        handler: Arc<dyn ActionHandler>,
    ) {
        self.per_protocol.insert((protocol, action.into()), handler);
    }

    pub fn resolve(&self, protocol: OcppProtocol, action: &str) -> Option<Arc<dyn ActionHandler>> {
        self.per_protocol
            .get(&(protocol, action.to_string()))
            .or_else(|| self.generic.get(action))
            .cloned()
    }

    /// Run one inbound CALL through conversion, the handler and back.
    pub async fn handle(&self, ctx: &CallContext, call: Call) -> OcppMessage {
        let message_id = call.message_id.clone();
        let handler = canonical_action(ctx.protocol, &call.action)
            .ok()
            .and_then(|action| self.resolve(ctx.protocol, &action));
        let Some(handler) = handler else {
            debug!(
                charge_point_id = %ctx.charge_point_id,
                action = %call.action,
                "no handler registered"
            );
            return OcppMessage::error(
                message_id,
                ErrorCode::NotImplemented,
                format!("Action {} is not implemented", call.action),
            );
        };

        let request = match self.manager.convert_to_internal(
            &OcppMessage::Call(call),
            &ctx.charge_point_id,
            ctx.protocol,
        ) {
            Ok(internal) => internal,
            Err(e) => {
                warn!(charge_point_id = %ctx.charge_point_id, error = %e, "inbound conversion failed");
                return OcppMessage::error(message_id, e.error_code(), e.to_string());
            }
        };

        let payload = match handler.handle(ctx, request.payload.clone()).await {
            Ok(payload) => payload,
            Err(e) => {
                error!(
                    charge_point_id = %ctx.charge_point_id,
                    action = %request.action,
                    error = %e,
                    "handler failed"
                );
                return OcppMessage::error(message_id, ErrorCode::InternalError, e.to_string());
            }
        };

        match self.manager.convert_from_internal(&request.reply(payload)) {
            Ok(reply) => reply,
            Err(e) => {
                error!(
                    charge_point_id = %ctx.charge_point_id,
                    action = %request.action,
                    error = %e,
                    "reply conversion failed"
                );
                OcppMessage::error(message_id, ErrorCode::InternalError, e.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx(protocol: OcppProtocol) -> CallContext {
        CallContext {
            connection_id: Uuid::new_v4(),
            charge_point_id: "CP-1".into(),
            protocol,
        }
    }

    fn call(id: &str, action: &str, payload: Value) -> Call {
        Call {
            message_id: id.into(),
            action: action.into(),
            payload,
        }
    }

    fn dispatcher() -> ActionDispatcher {
        ActionDispatcher::new(Arc::new(ProtocolAdapterManager::new(true, None)))
    }

    #[tokio::test]
    async fn test_unknown_action_is_not_implemented() {
        let reply = dispatcher()
            .handle(&ctx(OcppProtocol::Ocpp16), call("77", "FooBar", json!({})))
            .await;
        let OcppMessage::CallError(e) = reply else {
            panic!("expected CALLERROR");
        };
        assert_eq!(e.message_id, "77");
        assert_eq!(e.error_code, ErrorCode::NotImplemented);
    }

    #[tokio::test]
    async fn test_handler_error_becomes_internal_error() {
        let mut d = dispatcher();
        d.register(
            "Heartbeat",
            Arc::new(|_ctx: CallContext, _p: Value| async { Err(anyhow::anyhow!("store offline")) }),
        );
        let reply = d
            .handle(&ctx(OcppProtocol::Ocpp16), call("5", "Heartbeat", json!({})))
            .await;
        let OcppMessage::CallError(e) = reply else {
            panic!("expected CALLERROR");
        };
        assert_eq!(e.message_id, "5");
        assert_eq!(e.error_code, ErrorCode::InternalError);
        assert_eq!(e.error_description, "store offline");
    }

    #[tokio::test]
    async fn test_reply_is_shaped_for_the_protocol() {
        let mut d = dispatcher();
        d.register(
            "Authorize",
            Arc::new(|_ctx: CallContext, p: Value| async move {
                assert_eq!(p["idTag"], "TAG-1");
                Ok(json!({"idTagInfo": {"status": "Blocked"}}))
            }),
        );

        let v16 = d
            .handle(&ctx(OcppProtocol::Ocpp16), call("1", "Authorize", json!({"idTag": "TAG-1"})))
            .await;
        assert_eq!(v16.serialize(), r#"[3,"1",{"idTagInfo":{"status":"Blocked"}}]"#);

        let v2 = d
            .handle(
                &ctx(OcppProtocol::Ocpp20),
                call("2", "Authorize", json!({"idToken": {"idToken": "TAG-1", "type": "ISO14443"}})),
            )
            .await;
        assert_eq!(v2.serialize(), r#"[3,"2",{"idTokenInfo":{"status":"Blocked"}}]"#);
    }

    #[tokio::test]
    async fn test_protocol_specific_handler_wins() {
        let mut d = dispatcher();
        d.register(
            "DataTransfer",
            Arc::new(|_c: CallContext, _p: Value| async { Ok(json!({"status": "Rejected"})) }),
        );
        d.register_for(
            OcppProtocol::Ocpp21,
            "DataTransfer",
            Arc::new(|_c: CallContext, _p: Value| async { Ok(json!({"status": "Accepted"})) }),
        );

        let generic = d
            .handle(&ctx(OcppProtocol::Ocpp16), call("1", "DataTransfer", json!({"vendorId": "v"})))
            .await;
        let specific = d
            .handle(&ctx(OcppProtocol::Ocpp21), call("2", "DataTransfer", json!({"vendorId": "v"})))
            .await;
        assert_eq!(generic.serialize(), r#"[3,"1",{"status":"Rejected"}]"#);
        assert_eq!(specific.serialize(), r#"[3,"2",{"status":"Accepted"}]"#);
    }

    #[tokio::test]
    async fn test_bad_payload_is_formation_violation() {
        let mut d = dispatcher();
        d.register(
            "Authorize",
            Arc::new(|_c: CallContext, _p: Value| async { Ok(json!({})) }),
        );
        let reply = d
            .handle(&ctx(OcppProtocol::Ocpp16), call("9", "Authorize", json!({"tag": 1})))
            .await;
        let OcppMessage::CallError(e) = reply else {
            panic!("expected CALLERROR");
        };
        assert_eq!(e.error_code, ErrorCode::FormationViolation);
    }
}
