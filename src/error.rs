//! Error kinds surfaced by the bus.
//!
//! `Connection`, `Bind`, `NotConnected`, `AlreadyConnected` and
//! `AlreadyStarted` are returned to callers. The per-message kinds
//! (`MalformedEnvelope`, `RoutingMiss`, `UnknownPeer`, `DuplicatePeer`,
//! `HandlerPanicked`) are produced inside receive loops, logged there, and never end a connection
//! on their own.

// Rust guideline compliant 2026-02

use thiserror::Error;

/// Errors produced by hub and peer endpoints.
#[derive(Debug, Error)]
pub enum BusError {
    /// The transport could not be opened or accepted.
    #[error("connection error: {0}")]
    Connection(String),

    /// A send was attempted before the endpoint reached `Registered`.
    #[error("not connected: endpoint is {0}")]
    NotConnected(String),

    /// The hub could not open its listening transport.
    #[error("bind error on {address}: {reason}")]
    Bind {
        /// Address the hub tried to bind.
        address: String,
        /// Underlying failure.
        reason: String,
    },

    /// No registered peer carries this identity.
    #[error("unknown peer: {0}")]
    UnknownPeer(String),

    /// A frame could not be parsed or validated as an envelope.
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),

    /// Nothing is listening for this envelope.
    #[error("routing miss: {0}")]
    RoutingMiss(String),

    /// The identity is already registered on another live connection.
    #[error("duplicate peer identity: {0}")]
    DuplicatePeer(String),

    /// `connect` was called on an endpoint that already left `Disconnected`.
    #[error("endpoint already connected (state: {0})")]
    AlreadyConnected(String),

    /// `start` was called on a hub that is already listening.
    #[error("hub already started on {0}")]
    AlreadyStarted(String),

    /// A user handler or callback panicked while processing an envelope.
    #[error("handler panicked: {0}")]
    HandlerPanicked(String),
}

/// Result alias for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Log an envelope dropped at a receive-loop boundary.
///
/// Routing misses are routine (nobody listens for that name) and go to
/// debug; everything else is a warning.
pub(crate) fn log_dropped(component: &str, source: &str, err: &BusError) {
    match err {
        BusError::RoutingMiss(_) => {
            log::debug!("[{component}] Dropped envelope from {source}: {err}");
        }
        _ => log::warn!("[{component}] Dropped envelope from {source}: {err}"),
    }
}

/// Run a user handler, turning a panic into [`BusError::HandlerPanicked`].
///
/// Handlers run on connection read tasks; a panic must not take the
/// connection down with it.
pub(crate) fn run_handler<F: FnOnce()>(what: &str, handler: F) -> Result<()> {
    std::panic::catch_unwind(std::panic::AssertUnwindSafe(handler)).map_err(|payload| {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string());
        BusError::HandlerPanicked(format!("{what}: {message}"))
    })
}
