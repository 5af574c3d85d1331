//! Shared WebSocket transport.
//!
//! Thin wrapper around `tokio-tungstenite` providing type-isolated
//! reader/writer halves. Both endpoints go through this module rather than
//! `tokio-tungstenite` directly: the peer via [`connect`], the hub via
//! [`accept`]. Each returns a ([`WsWriter`], [`WsReader`]) pair so the two
//! directions can live in separate tasks.

// Rust guideline compliant 2026-02

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::error::{BusError, Result};

/// Stream type produced by [`connect`].
pub type ClientStream = MaybeTlsStream<TcpStream>;

/// Item queued for a connection's write task.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Outbound {
    /// Serialized envelope.
    Text(String),
    /// Close the connection with this reason.
    Close(String),
}

/// Received WebSocket message.
#[derive(Debug)]
pub enum WsMessage {
    /// UTF-8 text frame.
    Text(String),
    /// Binary frame.
    Binary(Vec<u8>),
    /// Ping frame with payload.
    Ping(Vec<u8>),
    /// Pong frame with payload.
    Pong(Vec<u8>),
    /// Close frame with status code and reason.
    Close {
        /// WebSocket close code (1000 = normal, 1005 = no code).
        code: u16,
        /// Human-readable close reason.
        reason: String,
    },
}

/// Write half of a WebSocket connection.
#[derive(Debug)]
pub struct WsWriter<S> {
    sink: SplitSink<WebSocketStream<S>, tungstenite::Message>,
}

impl<S> WsWriter<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Send a UTF-8 text frame.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Connection`] if the send fails (connection closed, I/O error).
    pub async fn send_text(&mut self, text: &str) -> Result<()> {
        self.sink
            .send(tungstenite::Message::Text(text.to_string()))
            .await
            .map_err(|e| BusError::Connection(format!("WebSocket send_text failed: {e}")))
    }

    /// Send a close frame with a reason.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Connection`] if the send fails.
    pub async fn send_close(&mut self, reason: &str) -> Result<()> {
        let frame = tungstenite::protocol::CloseFrame {
            code: tungstenite::protocol::frame::coding::CloseCode::Policy,
            reason: reason.to_string().into(),
        };
        self.sink
            .send(tungstenite::Message::Close(Some(frame)))
            .await
            .map_err(|e| BusError::Connection(format!("WebSocket send_close failed: {e}")))
    }
}

/// Read half of a WebSocket connection.
#[derive(Debug)]
pub struct WsReader<S> {
    stream: SplitStream<WebSocketStream<S>>,
}

impl<S> WsReader<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Receive the next message, returning `None` when the stream ends.
    ///
    /// Raw `Frame` variants are skipped internally.
    pub async fn recv(&mut self) -> Option<Result<WsMessage>> {
        loop {
            match self.stream.next().await {
                Some(Ok(tungstenite::Message::Text(text))) => {
                    return Some(Ok(WsMessage::Text(text.to_string())));
                }
                Some(Ok(tungstenite::Message::Binary(data))) => {
                    return Some(Ok(WsMessage::Binary(data.to_vec())));
                }
                Some(Ok(tungstenite::Message::Ping(data))) => {
                    return Some(Ok(WsMessage::Ping(data.to_vec())));
                }
                Some(Ok(tungstenite::Message::Pong(data))) => {
                    return Some(Ok(WsMessage::Pong(data.to_vec())));
                }
                Some(Ok(tungstenite::Message::Close(close_frame))) => {
                    let (code, reason) = close_frame
                        .map(|cf| (cf.code.into(), cf.reason.to_string()))
                        .unwrap_or((1005, String::new()));
                    return Some(Ok(WsMessage::Close { code, reason }));
                }
                Some(Ok(tungstenite::Message::Frame(_))) => {
                    // Raw frames — skip
                    continue;
                }
                Some(Err(e)) => {
                    return Some(Err(BusError::Connection(format!(
                        "WebSocket read error: {e}"
                    ))));
                }
                None => return None,
            }
        }
    }
}

/// Write loop — drains the outbound queue into the socket.
///
/// One per connection, so writes on a connection never interleave. Ends on
/// a write error, after sending a close frame, or when every sender is gone.
pub(crate) async fn write_loop<S>(
    component: &'static str,
    conn: String,
    mut writer: WsWriter<S>,
    mut frame_rx: UnboundedReceiver<Outbound>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(item) = frame_rx.recv().await {
        match item {
            Outbound::Text(text) => {
                if let Err(e) = writer.send_text(&text).await {
                    log::error!("[{component}] Write error for {conn}: {e}");
                    break;
                }
            }
            Outbound::Close(reason) => {
                log::debug!("[{component}] Closing {conn}: {reason}");
                if let Err(e) = writer.send_close(&reason).await {
                    log::debug!("[{component}] Close frame to {conn} not sent: {e}");
                }
                break;
            }
        }
    }
}

fn ws_config(max_message_size: usize) -> WebSocketConfig {
    let mut config = WebSocketConfig::default();
    config.max_message_size = Some(max_message_size);
    config.max_frame_size = Some(max_message_size);
    config
}

/// Connect to a hub.
///
/// `address` is either a bare `host:port` or a full `ws://` URL.
///
/// # Errors
///
/// Returns [`BusError::Connection`] if the URL is invalid or the WebSocket
/// handshake fails.
pub async fn connect(
    address: &str,
    max_message_size: usize,
) -> Result<(WsWriter<ClientStream>, WsReader<ClientStream>)> {
    let url = hub_url(address);
    let config = Some(ws_config(max_message_size));
    let (ws_stream, _response) =
        tokio_tungstenite::connect_async_with_config(url.as_str(), config, false)
            .await
            .map_err(|e| BusError::Connection(format!("WebSocket connect to {url} failed: {e}")))?;

    let (sink, stream) = ws_stream.split();

    Ok((WsWriter { sink }, WsReader { stream }))
}

/// Complete the server side of the WebSocket handshake on an accepted socket.
///
/// # Errors
///
/// Returns [`BusError::Connection`] if the handshake fails.
pub async fn accept(
    stream: TcpStream,
    max_message_size: usize,
) -> Result<(WsWriter<TcpStream>, WsReader<TcpStream>)> {
    let config = Some(ws_config(max_message_size));
    let ws_stream = tokio_tungstenite::accept_async_with_config(stream, config)
        .await
        .map_err(|e| BusError::Connection(format!("WebSocket handshake failed: {e}")))?;

    let (sink, stream) = ws_stream.split();

    Ok((WsWriter { sink }, WsReader { stream }))
}

/// Normalize a hub address into a `ws://` URL.
///
/// Bare `host:port` gains a `ws://` prefix, HTTP(S) schemes are converted,
/// and `ws://` / `wss://` pass through unchanged.
#[must_use]
pub fn hub_url(address: &str) -> String {
    if address.starts_with("wss://") || address.starts_with("ws://") {
        address.to_string()
    } else if address.starts_with("https://") || address.starts_with("http://") {
        address
            .replacen("https://", "wss://", 1)
            .replacen("http://", "ws://", 1)
    } else {
        format!("ws://{address}")
    }
}
