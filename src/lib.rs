//! wsbus - hub-and-spoke message bus over WebSocket.
//!
//! One process runs a [`Hub`]; any number of named [`Peer`]s connect to it.
//! Every message is a JSON envelope carried in one text frame.
//!
//! # Architecture
//!
//! - **Hub** - accepts connections, keeps the peer registry, dispatches
//!   incoming notifies and requests to name-keyed handlers
//! - **Peer** - one connection per identity; sends notifies and requests,
//!   correlates responses back to the [`RequestHandle`] that issued them
//! - **Envelope** - the four wire shapes and their JSON codec
//!
//! # Communication patterns
//!
//! - fire-and-forget notifies, peer to hub and hub to one or all peers
//! - requests answered by zero or more partial responses and one final one
//!
//! # Modules
//!
//! - [`envelope`] - wire format
//! - [`hub`] - hub endpoint and [`Responder`]
//! - [`peer`] - peer endpoint and request correlation
//! - [`dispatch`] - handler tables shared by both endpoints
//! - [`config`] - configuration loading/saving

pub mod config;
pub mod dispatch;
pub mod envelope;
pub mod error;
pub mod hub;
pub mod peer;
pub mod ws;

pub use config::Config;
pub use envelope::{Envelope, EnvelopeKind, Notify, Registration, Request, Response};
pub use error::{BusError, Result};
pub use hub::{Hub, Responder};
pub use peer::{ConnectionState, Peer, RequestHandle};
