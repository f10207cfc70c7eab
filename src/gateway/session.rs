//! Per-socket session
//!
//! The read loop is the connection's actor: frames are handled one at a time
//! in arrival order. Outbound frames go through a bounded queue drained by a
//! separate write pump, so correlated calls and broadcasts never touch the
//! socket directly.

use axum::extract::ws::{Message, WebSocket};
use futures_util::{Sink, SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::connection::Transport;
use super::AppState;
use crate::ocpp::{CallContext, OcppMessage, VersionInfo};

/// Drive one accepted socket until it closes or is evicted.
pub async fn run_session(
    state: AppState,
    socket: WebSocket,
    charge_point_id: String,
    version: &'static VersionInfo,
) {
    let (sink, mut stream) = socket.split();
    let (tx, rx) = mpsc::channel::<String>(state.cfg.ocpp.send_buffer.max(1));
    let cancel = CancellationToken::new();

    let connection = state.connections.register(
        &charge_point_id,
        Transport::new(tx.clone(), cancel.clone()),
        version,
    );
    let writer = tokio::spawn(write_pump(sink, rx, cancel.clone()));
    let ctx = CallContext {
        connection_id: connection.id,
        charge_point_id,
        protocol: version.protocol,
    };

    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = stream.next() => frame,
        };
        match frame {
            Some(Ok(Message::Text(text))) => {
                if let Some(reply) = handle_frame(&state, &ctx, &text).await {
                    debug!(charge_point_id = %ctx.charge_point_id, frame = %reply, "outbound");
                    if tx.send(reply).await.is_err() {
                        break;
                    }
                }
            }
            Some(Ok(Message::Binary(_))) => {
                warn!(charge_point_id = %ctx.charge_point_id, "binary frame ignored");
            }
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                warn!(charge_point_id = %ctx.charge_point_id, error = %e, "socket read failed");
                break;
            }
        }
    }

    cancel.cancel();
    state.requests.cancel_connection(ctx.connection_id);
    state.connections.remove(ctx.connection_id);
    let _ = writer.await;
    info!(
        charge_point_id = %ctx.charge_point_id,
        connection_id = %ctx.connection_id,
        "session closed"
    );
}

/// Handle one inbound text frame. Returns the reply frame for a CALL.
pub async fn handle_frame(state: &AppState, ctx: &CallContext, text: &str) -> Option<String> {
    state.connections.touch_heartbeat(ctx.connection_id);
    debug!(charge_point_id = %ctx.charge_point_id, frame = %text, "inbound");

    let msg = match OcppMessage::parse(text) {
        Ok(msg) => msg,
        Err(e) => {
            warn!(charge_point_id = %ctx.charge_point_id, error = %e, "dropping malformed frame");
            return None;
        }
    };
    match msg {
        OcppMessage::Call(call) => Some(state.dispatcher.handle(ctx, call).await.serialize()),
        reply => {
            if !state.requests.resolve(ctx.connection_id, &reply) {
                debug!(
                    charge_point_id = %ctx.charge_point_id,
                    message_id = %reply.message_id(),
                    "reply without a waiting call"
                );
            }
            None
        }
    }
}

pub(crate) async fn write_pump<S>(mut sink: S, mut rx: mpsc::Receiver<String>, cancel: CancellationToken)
where
    S: Sink<Message, Error = axum::Error> + Unpin,
{
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            frame = rx.recv() => match frame {
                Some(text) => {
                    if let Err(e) = sink.send(Message::Text(text)).await {
                        warn!(error = %e, "socket write failed");
                        break;
                    }
                }
                None => break,
            },
        }
    }
    cancel.cancel();
    let _ = sink.send(Message::Close(None)).await;
}
