//! Live charge point connection table
//!
//! One mutex guards the whole table. Every mutation, including the stale
//! sweep's decide-and-evict step, runs under it, so a heartbeat written
//! before the sweep takes the lock is always seen by the sweep. Transports are
//! closed only after the lock is released. Reads hand out snapshot copies.

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::ocpp::canonical::ConnectorStatus;
use crate::ocpp::version::{OcppProtocol, VersionInfo};

pub type ConnectionId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionStatus {
    Connected,
    Available,
    Occupied,
    Faulted,
    Unavailable,
    Disconnected,
}

impl From<ConnectorStatus> for ConnectionStatus {
    fn from(status: ConnectorStatus) -> Self {
        use ConnectorStatus as S;
        match status {
            S::Available => Self::Available,
            S::Preparing
            | S::Charging
            | S::SuspendedEV
            | S::SuspendedEVSE
            | S::Finishing
            | S::Reserved
            | S::Occupied => Self::Occupied,
            S::Faulted => Self::Faulted,
            S::Unavailable => Self::Unavailable,
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("outbound buffer is full")]
    Full,
    #[error("connection is closed")]
    Closed,
}

/// Outbound half of a socket. Frames are queued for the session's write pump.
#[derive(Debug, Clone)]
pub struct Transport {
    tx: mpsc::Sender<String>,
    cancel: CancellationToken,
}

impl Transport {
    pub fn new(tx: mpsc::Sender<String>, cancel: CancellationToken) -> Self {
        Self { tx, cancel }
    }

    /// Queue a frame without waiting.
    pub fn send(&self, frame: String) -> Result<(), TransportError> {
        if self.cancel.is_cancelled() {
            return Err(TransportError::Closed);
        }
        self.tx.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => TransportError::Full,
            mpsc::error::TrySendError::Closed(_) => TransportError::Closed,
        })
    }

    /// Ask the session to close the socket.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled() || self.tx.is_closed()
    }
}

/// One accepted socket. Values handed out by [`ConnectionManager`] are copies.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChargePointConnection {
    pub id: ConnectionId,
    pub charge_point_id: String,
    pub ocpp_version: String,
    pub protocol: OcppProtocol,
    pub status: ConnectionStatus,
    pub connected_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    #[serde(skip)]
    pub transport: Transport,
    #[serde(skip)]
    registration: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatistics {
    pub total_connections: usize,
    pub active_charge_points: usize,
    pub connections_by_status: HashMap<ConnectionStatus, usize>,
    pub connections_by_version: HashMap<String, usize>,
    pub average_connection_age_secs: f64,
}

#[derive(Default)]
pub struct ConnectionManager {
    connections: Mutex<HashMap<ConnectionId, ChargePointConnection>>,
    registrations: AtomicU64,
}

/// `now - max_idle_minutes`, or `None` for a non-positive or out of range threshold.
pub fn stale_cutoff(now: DateTime<Utc>, max_idle_minutes: i64) -> Option<DateTime<Utc>> {
    if max_idle_minutes <= 0 {
        return None;
    }
    Duration::try_minutes(max_idle_minutes).and_then(|idle| now.checked_sub_signed(idle))
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        charge_point_id: &str,
        transport: Transport,
        version: &VersionInfo,
    ) -> ChargePointConnection {
        let now = Utc::now();
        let connection = ChargePointConnection {
            id: Uuid::new_v4(),
            charge_point_id: charge_point_id.to_string(),
            ocpp_version: version.version.to_string(),
            protocol: version.protocol,
            status: ConnectionStatus::Connected,
            connected_at: now,
            last_heartbeat: now,
            transport,
            registration: self.registrations.fetch_add(1, Ordering::SeqCst),
        };

        let mut table = self.connections.lock();
        let siblings = table
            .values()
            .filter(|c| c.charge_point_id == charge_point_id)
            .count();
        table.insert(connection.id, connection.clone());
        drop(table);

        if siblings > 0 {
            warn!(
                charge_point_id,
                connection_id = %connection.id,
                siblings,
                "charge point already connected; newest connection is authoritative"
            );
        }
        info!(
            charge_point_id,
            connection_id = %connection.id,
            protocol = %connection.protocol,
            version = %connection.ocpp_version,
            "charge point registered"
        );
        connection
    }

    /// Refresh `last_heartbeat`. Never moves it backwards.
    pub fn touch_heartbeat(&self, id: ConnectionId) -> bool {
        let now = Utc::now();
        match self.connections.lock().get_mut(&id) {
            Some(c) => {
                if now > c.last_heartbeat {
                    c.last_heartbeat = now;
                }
                true
            }
            None => false,
        }
    }

    pub fn set_status(&self, id: ConnectionId, status: ConnectionStatus) -> bool {
        match self.connections.lock().get_mut(&id) {
            Some(c) => {
                if c.status != status {
                    debug!(
                        charge_point_id = %c.charge_point_id,
                        connection_id = %id,
                        from = ?c.status,
                        to = ?status,
                        "connection status changed"
                    );
                    c.status = status;
                }
                true
            }
            None => false,
        }
    }

    pub fn get(&self, id: ConnectionId) -> Option<ChargePointConnection> {
        self.connections.lock().get(&id).cloned()
    }

    /// All live connections for an identity, oldest first.
    pub fn get_by_charge_point_id(&self, charge_point_id: &str) -> Vec<ChargePointConnection> {
        let mut found: Vec<_> = self
            .connections
            .lock()
            .values()
            .filter(|c| c.charge_point_id == charge_point_id)
            .cloned()
            .collect();
        found.sort_by_key(|c| c.registration);
        found
    }

    /// The most recently registered connection for an identity.
    pub fn authoritative(&self, charge_point_id: &str) -> Option<ChargePointConnection> {
        self.connections
            .lock()
            .values()
            .filter(|c| c.charge_point_id == charge_point_id)
            .max_by_key(|c| c.registration)
            .cloned()
    }

    /// Queue `frame` on every connection for `charge_point_id`. Returns how many accepted it.
    pub fn broadcast(&self, charge_point_id: &str, frame: &str) -> usize {
        self.broadcast_with(charge_point_id, |_| Some(frame.to_string()))
    }

    /// Like [`broadcast`](Self::broadcast) with a frame built per connection,
    /// so mixed protocol versions each get their own dialect. `None` skips a connection.
    pub fn broadcast_with<F>(&self, charge_point_id: &str, mut frame_for: F) -> usize
    where
        F: FnMut(&ChargePointConnection) -> Option<String>,
    {
        let targets = self.get_by_charge_point_id(charge_point_id);
        targets
            .iter()
            .filter(|c| {
                let Some(frame) = frame_for(*c) else {
                    return false;
                };
                match c.transport.send(frame) {
                    Ok(()) => true,
                    Err(e) => {
                        warn!(charge_point_id, connection_id = %c.id, error = %e, "broadcast send failed");
                        false
                    }
                }
            })
            .count()
    }

    /// Drop a connection and close its transport.
    pub fn remove(&self, id: ConnectionId) -> Option<ChargePointConnection> {
        let removed = self.connections.lock().remove(&id);
        if let Some(c) = &removed {
            c.transport.close();
            info!(charge_point_id = %c.charge_point_id, connection_id = %id, "connection removed");
        }
        removed
    }

    pub fn remove_all_by_charge_point_id(&self, charge_point_id: &str) -> usize {
        let removed: Vec<_> = {
            let mut table = self.connections.lock();
            let ids: Vec<_> = table
                .values()
                .filter(|c| c.charge_point_id == charge_point_id)
                .map(|c| c.id)
                .collect();
            ids.iter().filter_map(|id| table.remove(id)).collect()
        };
        for c in &removed {
            c.transport.close();
        }
        if !removed.is_empty() {
            info!(charge_point_id, count = removed.len(), "connections removed");
        }
        removed.len()
    }

    /// Evict every connection idle for longer than `max_idle_minutes`.
    pub fn cleanup_stale(&self, max_idle_minutes: i64) -> usize {
        self.evict_stale(max_idle_minutes).len()
    }

    /// Like [`cleanup_stale`](Self::cleanup_stale), returning the evicted connections.
    /// A threshold that is not a positive, representable duration evicts nothing.
    pub fn evict_stale(&self, max_idle_minutes: i64) -> Vec<ChargePointConnection> {
        match stale_cutoff(Utc::now(), max_idle_minutes) {
            Some(cutoff) => self.evict_idle_since(cutoff),
            None => {
                warn!(max_idle_minutes, "unusable stale threshold; sweep skipped");
                Vec::new()
            }
        }
    }

    /// Evict every connection whose last heartbeat is older than `cutoff`.
    pub fn evict_idle_since(&self, cutoff: DateTime<Utc>) -> Vec<ChargePointConnection> {
        let evicted: Vec<_> = {
            let mut table = self.connections.lock();
            let stale: Vec<_> = table
                .values()
                .filter(|c| c.last_heartbeat < cutoff)
                .map(|c| c.id)
                .collect();
            stale.iter().filter_map(|id| table.remove(id)).collect()
        };
        for c in &evicted {
            c.transport.close();
            warn!(
                charge_point_id = %c.charge_point_id,
                connection_id = %c.id,
                last_heartbeat = %c.last_heartbeat,
                "evicted stale connection"
            );
        }
        evicted
    }

    #[cfg(test)]
    pub(crate) fn set_last_heartbeat(&self, id: ConnectionId, at: DateTime<Utc>) {
        if let Some(c) = self.connections.lock().get_mut(&id) {
            c.last_heartbeat = at;
        }
    }

    pub fn get_all(&self) -> Vec<ChargePointConnection> {
        let mut all: Vec<_> = self.connections.lock().values().cloned().collect();
        all.sort_by_key(|c| c.registration);
        all
    }

    pub fn len(&self) -> usize {
        self.connections.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get_statistics(&self) -> ConnectionStatistics {
        let all = self.get_all();
        if all.is_empty() {
            return ConnectionStatistics::default();
        }

        let now = Utc::now();
        let mut stats = ConnectionStatistics {
            total_connections: all.len(),
            ..Default::default()
        };
        let mut identities = HashSet::new();
        let mut total_age = 0.0;
        for c in &all {
            identities.insert(c.charge_point_id.as_str());
            *stats.connections_by_status.entry(c.status).or_default() += 1;
            *stats
                .connections_by_version
                .entry(c.ocpp_version.clone())
                .or_default() += 1;
            total_age += (now - c.connected_at).num_milliseconds() as f64 / 1000.0;
        }
        stats.active_charge_points = identities.len();
        stats.average_connection_age_secs = total_age / all.len() as f64;
        stats
    }
}
