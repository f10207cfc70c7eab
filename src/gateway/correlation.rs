//! Outbound CALLs that wait for the charge point's answer
//!
//! Pending calls are keyed by `(connection id, message id)`. A reply and the
//! timeout race to remove the entry; whichever removes it completes the call
//! and the other path does nothing.

use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::connection::{ChargePointConnection, ConnectionId, TransportError};
use crate::ocpp::adapter::ConversionError;
use crate::ocpp::canonical::InternalMessage;
use crate::ocpp::manager::ProtocolAdapterManager;
use crate::ocpp::wire::{ErrorCode, OcppMessage};

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Error, PartialEq)]
pub enum CorrelationError {
    #[error("no reply to {action} within {timeout:?}")]
    Timeout { action: String, timeout: Duration },

    #[error("charge point answered {code}: {description}")]
    Remote {
        code: ErrorCode,
        description: String,
        details: Value,
    },

    #[error("connection closed before a reply arrived")]
    ConnectionClosed,

    #[error("charge point {0} is not connected")]
    NotConnected(String),

    #[error(transparent)]
    Conversion(#[from] ConversionError),

    #[error("send failed: {0}")]
    Send(#[from] TransportError),
}

type Reply = Result<Value, CorrelationError>;

struct PendingCall {
    action: String,
    reply: oneshot::Sender<Reply>,
}

/// Drops the pending entry when the waiting future goes away early.
struct PendingGuard<'a> {
    pending: &'a Mutex<HashMap<(ConnectionId, String), PendingCall>>,
    key: &'a (ConnectionId, String),
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.pending.lock().remove(self.key).is_some() {
            debug!(connection_id = %self.key.0, message_id = %self.key.1, "caller gone; pending call dropped");
        }
    }
}

pub struct CorrelatedRequestClient {
    adapters: Arc<ProtocolAdapterManager>,
    pending: Mutex<HashMap<(ConnectionId, String), PendingCall>>,
    default_timeout: Duration,
}

impl CorrelatedRequestClient {
    pub fn new(adapters: Arc<ProtocolAdapterManager>, default_timeout: Duration) -> Self {
        Self {
            adapters,
            pending: Mutex::new(HashMap::new()),
            default_timeout,
        }
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Shape a canonical command as a CALL for `connection`'s protocol.
    pub fn build_call(
        &self,
        connection: &ChargePointConnection,
        action: &str,
        payload: Value,
    ) -> Result<OcppMessage, ConversionError> {
        let request = InternalMessage::request(
            Uuid::new_v4().to_string(),
            connection.charge_point_id.as_str(),
            action,
            payload,
            connection.protocol,
        );
        self.adapters.convert_from_internal(&request)
    }

    /// Send a canonical command and wait for the canonical result.
    pub async fn send_and_wait(
        &self,
        connection: &ChargePointConnection,
        action: &str,
        payload: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, CorrelationError> {
        let timeout = timeout.unwrap_or(self.default_timeout);
        let call = self.build_call(connection, action, payload)?;
        let key = (connection.id, call.message_id().to_string());

        let (tx, mut rx) = oneshot::channel();
        self.pending.lock().insert(
            key.clone(),
            PendingCall {
                action: action.to_string(),
                reply: tx,
            },
        );
        let _guard = PendingGuard {
            pending: &self.pending,
            key: &key,
        };

        debug!(
            charge_point_id = %connection.charge_point_id,
            connection_id = %connection.id,
            message_id = %key.1,
            action,
            "sending correlated call"
        );
        if let Err(e) = connection.transport.send(call.serialize()) {
            self.pending.lock().remove(&key);
            return Err(e.into());
        }

        let reply = match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(CorrelationError::ConnectionClosed),
            Err(_) => {
                if self.pending.lock().remove(&key).is_some() {
                    warn!(
                        charge_point_id = %connection.charge_point_id,
                        message_id = %key.1,
                        action,
                        "correlated call timed out"
                    );
                    return Err(CorrelationError::Timeout {
                        action: action.to_string(),
                        timeout,
                    });
                }
                // A reply claimed the entry first and is on its way.
                rx.await.unwrap_or(Err(CorrelationError::ConnectionClosed))
            }
        };

        let payload = reply?;
        Ok(self
            .adapters
            .convert_result(connection.protocol, action, payload)?)
    }

    /// Complete the pending call a CALLRESULT or CALLERROR answers.
    /// Returns false when nothing was waiting for it.
    pub fn resolve(&self, connection_id: ConnectionId, msg: &OcppMessage) -> bool {
        let reply = match msg {
            OcppMessage::CallResult(r) => Ok(r.payload.clone()),
            OcppMessage::CallError(e) => Err(CorrelationError::Remote {
                code: e.error_code.clone(),
                description: e.error_description.clone(),
                details: e.error_details.clone(),
            }),
            OcppMessage::Call(_) => return false,
        };

        let key = (connection_id, msg.message_id().to_string());
        let Some(pending) = self.pending.lock().remove(&key) else {
            debug!(connection_id = %connection_id, message_id = %key.1, "discarding late or unknown reply");
            return false;
        };
        debug!(connection_id = %connection_id, message_id = %key.1, action = %pending.action, "reply matched");
        // The waiter may have gone away; nothing else to do then.
        let _ = pending.reply.send(reply);
        true
    }

    /// Fail every call still waiting on a closed connection.
    pub fn cancel_connection(&self, connection_id: ConnectionId) -> usize {
        let cancelled: Vec<_> = {
            let mut pending = self.pending.lock();
            let keys: Vec<_> = pending
                .keys()
                .filter(|(id, _)| *id == connection_id)
                .cloned()
                .collect();
            keys.iter().filter_map(|k| pending.remove(k)).collect()
        };
        let count = cancelled.len();
        for call in cancelled {
            let _ = call.reply.send(Err(CorrelationError::ConnectionClosed));
        }
        if count > 0 {
            info!(connection_id = %connection_id, count, "cancelled pending calls");
        }
        count
    }

    /// 1.6 `GetConfiguration`. An empty key list asks for everything.
    pub async fn get_configuration(
        &self,
        connection: &ChargePointConnection,
        keys: &[String],
    ) -> Result<Value, CorrelationError> {
        let payload = if keys.is_empty() {
            json!({})
        } else {
            json!({ "key": keys })
        };
        self.send_and_wait(connection, "GetConfiguration", payload, None)
            .await
    }
}
