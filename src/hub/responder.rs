//! Reply handle given to request handlers.

// Rust guideline compliant 2026-02

use serde_json::Value;
use tokio::sync::mpsc::UnboundedSender;

use super::registry::ConnectionId;
use crate::envelope::{Envelope, Request, Response};
use crate::ws::Outbound;

/// Callback for incoming request envelopes.
pub type RequestHandler = dyn Fn(Request, Responder) + Send + Sync;

/// Sends responses for one request back over the connection it came from.
///
/// Cloneable and `Send`: a handler may move it into a spawned task and
/// answer later. [`Responder::end`] is not guarded against repeated calls;
/// every call sends another final response, which the peer logs as a
/// routing miss.
#[derive(Debug, Clone)]
pub struct Responder {
    request_id: u64,
    connection: ConnectionId,
    peer: String,
    frame_tx: UnboundedSender<Outbound>,
}

impl Responder {
    pub(crate) fn new(
        request_id: u64,
        connection: ConnectionId,
        peer: String,
        frame_tx: UnboundedSender<Outbound>,
    ) -> Self {
        Self {
            request_id,
            connection,
            peer,
            frame_tx,
        }
    }

    /// Correlation id of the request being answered.
    pub fn request_id(&self) -> u64 {
        self.request_id
    }

    /// Identity of the requesting peer (`unknown` if it never registered).
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Connection the request arrived on.
    pub fn connection_id(&self) -> &ConnectionId {
        &self.connection
    }

    /// Send a partial (non-final) response.
    ///
    /// Returns `false` if the connection is already gone.
    pub fn respond(&self, payload: Value) -> bool {
        self.send(Response::new(self.request_id, payload, false))
    }

    /// Send the final response, closing the exchange on the peer side.
    ///
    /// Returns `false` if the connection is already gone.
    pub fn end(&self, payload: Value) -> bool {
        self.send(Response::new(self.request_id, payload, true))
    }

    fn send(&self, response: Response) -> bool {
        let is_final = response.is_final;
        let text = Envelope::Response(response).to_text();
        let sent = self.frame_tx.send(Outbound::Text(text)).is_ok();
        if sent {
            log::debug!(
                "[Hub] [request {} {}] -> {} ({})",
                self.request_id,
                if is_final { "end" } else { "respond" },
                self.peer,
                self.connection
            );
        } else {
            log::debug!(
                "[Hub] [request {}] {} ({}) is gone, response dropped",
                self.request_id,
                self.peer,
                self.connection
            );
        }
        sent
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::sync::mpsc;

    fn decode(item: Outbound) -> Response {
        match item {
            Outbound::Text(text) => match Envelope::from_text(&text).unwrap() {
                Envelope::Response(r) => r,
                other => panic!("Expected Response, got: {other:?}"),
            },
            other => panic!("Expected Text, got: {other:?}"),
        }
    }

    #[test]
    fn test_respond_then_end() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let responder = Responder::new(9, ConnectionId::generate(), "ui".to_string(), tx);

        assert!(responder.respond(json!({"partial": true})));
        assert!(responder.end(json!({"total": 5})));

        let first = decode(rx.try_recv().unwrap());
        assert_eq!(first.request_id, 9);
        assert!(!first.is_final);
        assert_eq!(first.payload, json!({"partial": true}));

        let last = decode(rx.try_recv().unwrap());
        assert!(last.is_final);
        assert_eq!(last.payload, json!({"total": 5}));
    }

    #[test]
    fn test_end_twice_sends_twice() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let responder = Responder::new(1, ConnectionId::generate(), "ui".to_string(), tx);

        responder.end(json!(1));
        responder.end(json!(2));
        assert!(decode(rx.try_recv().unwrap()).is_final);
        assert!(decode(rx.try_recv().unwrap()).is_final);
    }

    #[test]
    fn test_send_after_connection_gone_returns_false() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let responder = Responder::new(1, ConnectionId::generate(), "ui".to_string(), tx);
        assert!(!responder.respond(json!(null)));
        assert!(!responder.end(json!(null)));
    }
}
