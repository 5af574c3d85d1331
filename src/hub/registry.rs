//! Peer registry with an identity index.
//!
//! Connections are recorded the moment they are accepted, keyed by
//! [`ConnectionId`]. A connection gains an identity only once its
//! registration envelope arrives; the `identities` reverse index then gives
//! O(1) lookup for targeted sends.
//!
//! ```text
//! connections: {
//!     conn:0a3f => { identity: Some("ui"),       .. },
//!     conn:1b07 => { identity: Some("settings"), .. },
//!     conn:2c11 => { identity: None,             .. },   // not registered yet
//! }
//! identities: { "ui" => conn:0a3f, "settings" => conn:1b07 }
//! ```

// Rust guideline compliant 2026-02

use std::collections::HashMap;
use std::net::SocketAddr;

use tokio::sync::mpsc::UnboundedSender;

use crate::envelope::{HUB_ID, UNKNOWN_SENDER};
use crate::error::{BusError, Result};
use crate::ws::Outbound;

/// Transport-level key assigned to every accepted connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// Generate a unique id using a monotonic counter + random suffix.
    pub(crate) fn generate() -> Self {
        use std::sync::atomic::{AtomicU64, Ordering};
        static COUNTER: AtomicU64 = AtomicU64::new(0);

        let seq = COUNTER.fetch_add(1, Ordering::Relaxed);
        let rand: u16 = rand::random();
        Self(format!("conn:{seq:x}{rand:04x}"))
    }

    /// The id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Hub-side record for one live connection.
#[derive(Debug)]
pub(crate) struct PeerRecord {
    /// Remote socket address.
    pub addr: SocketAddr,
    /// Identity from the registration envelope, once received.
    pub identity: Option<String>,
    /// Queue feeding the connection's write task.
    pub frame_tx: UnboundedSender<Outbound>,
}

/// Registry of live connections and registered identities.
#[derive(Debug, Default)]
pub(crate) struct PeerRegistry {
    connections: HashMap<ConnectionId, PeerRecord>,
    identities: HashMap<String, ConnectionId>,
}

impl PeerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a freshly accepted, not yet registered connection.
    pub fn insert(
        &mut self,
        id: ConnectionId,
        addr: SocketAddr,
        frame_tx: UnboundedSender<Outbound>,
    ) {
        self.connections.insert(
            id,
            PeerRecord {
                addr,
                identity: None,
                frame_tx,
            },
        );
    }

    /// Bind `identity` to the connection `id`.
    ///
    /// Returns `Ok(true)` when the identity was newly bound and `Ok(false)`
    /// when the connection had already registered (the new registration is
    /// ignored).
    ///
    /// # Errors
    ///
    /// - [`BusError::DuplicatePeer`] if another live connection holds
    ///   `identity`, or the identity is reserved (`hub`, `unknown`).
    /// - [`BusError::Connection`] if `id` is not a live connection.
    pub fn register(&mut self, id: &ConnectionId, identity: &str) -> Result<bool> {
        if identity == HUB_ID || identity == UNKNOWN_SENDER {
            return Err(BusError::DuplicatePeer(format!("'{identity}' is reserved")));
        }

        let record = self
            .connections
            .get(id)
            .ok_or_else(|| BusError::Connection(format!("connection {id} is not live")))?;

        if let Some(existing) = record.identity.as_deref() {
            log::warn!(
                "[Hub] {} already registered as '{}', ignoring registration as '{}'",
                id,
                existing,
                identity
            );
            return Ok(false);
        }

        if let Some(holder) = self.identities.get(identity) {
            return Err(BusError::DuplicatePeer(format!(
                "'{identity}' is already registered on {holder}"
            )));
        }

        self.identities.insert(identity.to_string(), id.clone());
        if let Some(record) = self.connections.get_mut(id) {
            record.identity = Some(identity.to_string());
        }
        Ok(true)
    }

    /// Remove a connection, purging its identity from the index.
    pub fn remove(&mut self, id: &ConnectionId) -> Option<PeerRecord> {
        let record = self.connections.remove(id)?;
        if let Some(identity) = record.identity.as_deref() {
            if self.identities.get(identity) == Some(id) {
                self.identities.remove(identity);
            }
        }
        Some(record)
    }

    /// Identity registered on connection `id`, if any.
    pub fn identity_of(&self, id: &ConnectionId) -> Option<&str> {
        self.connections.get(id)?.identity.as_deref()
    }

    /// Write queue of the peer registered as `identity` (O(1) lookup).
    pub fn sender_for(&self, identity: &str) -> Option<UnboundedSender<Outbound>> {
        let id = self.identities.get(identity)?;
        self.connections.get(id).map(|record| record.frame_tx.clone())
    }

    /// Snapshot of every registered peer and its write queue.
    pub fn registered(&self) -> Vec<(String, UnboundedSender<Outbound>)> {
        self.identities
            .iter()
            .filter_map(|(identity, id)| {
                self.connections
                    .get(id)
                    .map(|record| (identity.clone(), record.frame_tx.clone()))
            })
            .collect()
    }

    /// Registered identities, sorted.
    pub fn identities(&self) -> Vec<String> {
        let mut names: Vec<String> = self.identities.keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of live connections.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }
}
