//! Envelope model and text codec.
//!
//! Every frame on the wire is one JSON object discriminated by `kind`:
//!
//! ```text
//! {"kind":"registration","name":"register","payload":"ui","senderId":"ui",
//!  "targetId":null,"timestamp":1700000000000}
//! {"kind":"notify","name":"log","payload":{...},"senderId":"ui",
//!  "targetId":null,"timestamp":...}
//! {"kind":"request","name":"sum","payload":{...},"senderId":"ui",
//!  "targetId":null,"requestId":1,"timestamp":...}
//! {"kind":"response","requestId":1,"payload":{...},"final":false,"timestamp":...}
//! ```
//!
//! Decoding goes through [`Envelope::from_text`], which reports anything it
//! cannot reconstruct as [`BusError::MalformedEnvelope`]. Receive loops log
//! that error and move on to the next frame.

// Rust guideline compliant 2026-02

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{BusError, Result};

/// Sender identity used for everything the hub originates.
pub const HUB_ID: &str = "hub";

/// Sender identity assumed for connections that have not registered yet.
pub const UNKNOWN_SENDER: &str = "unknown";

/// `name` carried by every registration envelope.
pub const REGISTRATION_NAME: &str = "register";

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Discriminator of an [`Envelope`], used for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeKind {
    /// Peer announces its identity.
    Registration,
    /// Fire-and-forget message.
    Notify,
    /// Correlated request.
    Request,
    /// Partial or terminal reply to a request.
    Response,
}

impl std::fmt::Display for EnvelopeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Registration => "registration",
            Self::Notify => "notify",
            Self::Request => "request",
            Self::Response => "response",
        };
        f.write_str(s)
    }
}

/// Announces a peer's identity. Sent once, right after the transport opens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Registration {
    /// Always [`REGISTRATION_NAME`].
    pub name: String,
    /// The chosen identity, as a JSON string.
    #[serde(default)]
    pub payload: Value,
    /// Identity of the sender (same as the payload).
    pub sender_id: String,
    /// Unused; always `null`.
    #[serde(default)]
    pub target_id: Option<String>,
    /// Creation time in epoch milliseconds.
    #[serde(default = "now_millis")]
    pub timestamp: i64,
}

impl Registration {
    /// Build the registration envelope for `identity`.
    pub fn new(identity: impl Into<String>) -> Self {
        let identity = identity.into();
        Self {
            name: REGISTRATION_NAME.to_string(),
            payload: Value::String(identity.clone()),
            sender_id: identity,
            target_id: None,
            timestamp: now_millis(),
        }
    }

    /// The identity claimed by this registration, if the payload is a string.
    pub fn identity(&self) -> Option<&str> {
        self.payload.as_str()
    }
}

/// Fire-and-forget message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notify {
    /// Message name used for dispatch.
    pub name: String,
    /// Opaque payload.
    #[serde(default)]
    pub payload: Value,
    /// Identity of the originating endpoint.
    pub sender_id: String,
    /// Addressee. `None` means every peer (hub → peers) or the hub (peer → hub).
    #[serde(default)]
    pub target_id: Option<String>,
    /// Creation time in epoch milliseconds.
    #[serde(default = "now_millis")]
    pub timestamp: i64,
}

impl Notify {
    /// Build a notify envelope stamped with the current time.
    pub fn new(
        name: impl Into<String>,
        payload: Value,
        sender_id: impl Into<String>,
        target_id: Option<String>,
    ) -> Self {
        Self {
            name: name.into(),
            payload,
            sender_id: sender_id.into(),
            target_id,
            timestamp: now_millis(),
        }
    }
}

/// Request expecting zero or more partial responses and one final response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    /// Message name used for dispatch.
    pub name: String,
    /// Opaque payload.
    #[serde(default)]
    pub payload: Value,
    /// Identity of the originating peer.
    pub sender_id: String,
    /// Unused by dispatch; `null` addresses the hub.
    #[serde(default)]
    pub target_id: Option<String>,
    /// Correlation id, unique per sending endpoint.
    pub request_id: u64,
    /// Creation time in epoch milliseconds.
    #[serde(default = "now_millis")]
    pub timestamp: i64,
}

impl Request {
    /// Build a request envelope stamped with the current time.
    pub fn new(
        name: impl Into<String>,
        payload: Value,
        request_id: u64,
        sender_id: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            payload,
            sender_id: sender_id.into(),
            target_id: None,
            request_id,
            timestamp: now_millis(),
        }
    }
}

/// Reply to a [`Request`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    /// Correlation id of the originating request.
    pub request_id: u64,
    /// Opaque payload.
    #[serde(default)]
    pub payload: Value,
    /// `true` for the terminal response.
    #[serde(rename = "final", default)]
    pub is_final: bool,
    /// Creation time in epoch milliseconds.
    #[serde(default = "now_millis")]
    pub timestamp: i64,
}

impl Response {
    /// Build a response stamped with the current time.
    pub fn new(request_id: u64, payload: Value, is_final: bool) -> Self {
        Self {
            request_id,
            payload,
            is_final,
            timestamp: now_millis(),
        }
    }
}

/// One message unit on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Envelope {
    /// See [`Registration`].
    Registration(Registration),
    /// See [`Notify`].
    Notify(Notify),
    /// See [`Request`].
    Request(Request),
    /// See [`Response`].
    Response(Response),
}

impl Envelope {
    /// Discriminator of this envelope.
    pub fn kind(&self) -> EnvelopeKind {
        match self {
            Self::Registration(_) => EnvelopeKind::Registration,
            Self::Notify(_) => EnvelopeKind::Notify,
            Self::Request(_) => EnvelopeKind::Request,
            Self::Response(_) => EnvelopeKind::Response,
        }
    }

    /// Serialize into the JSON text carried by one frame.
    pub fn to_text(&self) -> String {
        // Fields are strings, integers, bools and `Value`s with string keys,
        // none of which serde_json can fail to write.
        serde_json::to_string(self).expect("envelope serialization cannot fail")
    }

    /// Parse and validate one frame.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::MalformedEnvelope`] if the text is not JSON, the
    /// `kind` is missing or unknown, a required field is absent, or the
    /// envelope violates its field contract (empty name, non-string
    /// registration identity).
    pub fn from_text(text: &str) -> Result<Self> {
        let envelope: Envelope = serde_json::from_str(text)
            .map_err(|e| BusError::MalformedEnvelope(e.to_string()))?;
        envelope.validate()?;
        Ok(envelope)
    }

    fn validate(&self) -> Result<()> {
        match self {
            Self::Registration(reg) => match reg.identity() {
                Some(id) if !id.is_empty() => Ok(()),
                Some(_) => Err(BusError::MalformedEnvelope(
                    "registration identity is empty".to_string(),
                )),
                None => Err(BusError::MalformedEnvelope(format!(
                    "registration payload must be a string, got {}",
                    reg.payload
                ))),
            },
            Self::Notify(Notify { name, .. }) | Self::Request(Request { name, .. })
                if name.is_empty() =>
            {
                Err(BusError::MalformedEnvelope(format!(
                    "{} envelope has an empty name",
                    self.kind()
                )))
            }
            _ => Ok(()),
        }
    }
}

impl From<Registration> for Envelope {
    fn from(value: Registration) -> Self {
        Self::Registration(value)
    }
}

impl From<Notify> for Envelope {
    fn from(value: Notify) -> Self {
        Self::Notify(value)
    }
}

impl From<Request> for Envelope {
    fn from(value: Request) -> Self {
        Self::Request(value)
    }
}

impl From<Response> for Envelope {
    fn from(value: Response) -> Self {
        Self::Response(value)
    }
}
