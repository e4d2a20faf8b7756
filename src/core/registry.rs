//! Connection registry for streaming subscribers.
//!
//! Every stream session owns the receiving half of a small bounded channel;
//! the registry holds the sending half. Membership changes on connect and
//! disconnect only, and the broadcaster iterates a copied snapshot, so a
//! connection leaving mid-tick never invalidates an iteration.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::core::types::{current_time_ms, StreamEvent};

/// Unique connection identifier.
pub type ConnectionId = Uuid;

/// Outbound buffer per connection. Small on purpose: a slow consumer drops
/// stale ticks and picks up the latest snapshot on the next one.
pub const CONNECTION_CHANNEL_CAPACITY: usize = 16;

/// Why a single emission failed
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmitError {
    #[error("connection closed")]
    Closed,
    #[error("connection buffer full")]
    Full,
}

/// One live subscriber.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    tx: mpsc::Sender<StreamEvent>,
    connected_at_ms: u64,
    open: AtomicBool,
}

impl Connection {
    pub fn new(tx: mpsc::Sender<StreamEvent>) -> Self {
        Self {
            id: Uuid::new_v4(),
            tx,
            connected_at_ms: current_time_ms(),
            open: AtomicBool::new(true),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn connected_at_ms(&self) -> u64 {
        self.connected_at_ms
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire) && !self.tx.is_closed()
    }

    pub fn close(&self) {
        self.open.store(false, Ordering::Release);
    }

    /// Queue an event without waiting.
    pub fn emit(&self, event: StreamEvent) -> Result<(), EmitError> {
        if !self.open.load(Ordering::Acquire) {
            return Err(EmitError::Closed);
        }
        self.tx.try_send(event).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => EmitError::Full,
            mpsc::error::TrySendError::Closed(_) => EmitError::Closed,
        })
    }
}

/// Registry of currently connected subscribers.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Arc<Connection>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new subscriber whose events go to `tx`.
    pub fn on_connect(&self, tx: mpsc::Sender<StreamEvent>) -> Arc<Connection> {
        let connection = Arc::new(Connection::new(tx));
        self.connections.insert(connection.id(), Arc::clone(&connection));
        info!(
            connection_id = %connection.id(),
            connections = self.connections.len(),
            "Client connected"
        );
        connection
    }

    /// Remove a subscriber. Returns `false` if it was not registered.
    pub fn on_disconnect(&self, id: &ConnectionId) -> bool {
        match self.connections.remove(id) {
            Some((_, connection)) => {
                connection.close();
                info!(
                    connection_id = %id,
                    connections = self.connections.len(),
                    "Client disconnected"
                );
                true
            }
            None => {
                debug!(connection_id = %id, "Disconnect for unknown connection ignored");
                false
            }
        }
    }

    /// Copy of the current membership, safe to iterate while others connect.
    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.connections
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.connections.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}
