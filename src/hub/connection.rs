//! Per-connection tasks (hub side).
//!
//! Each accepted TCP stream gets one task running [`serve`]: it completes
//! the WebSocket handshake, records the connection in the registry, spawns a
//! write task fed by an unbounded queue, then runs the read loop until the
//! peer goes away. Teardown purges the registry entry.
//!
//! Writes are serialized through the queue, so any number of responders and
//! broadcasts can target the same connection without coordinating.

// Rust guideline compliant 2026-02

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::sync::watch;

use super::registry::ConnectionId;
use super::HubShared;
use crate::error::{log_dropped, BusError};
use crate::ws::{self, Outbound, WsMessage, WsReader};

/// How long a shutting-down connection may take to flush its close frame.
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// Why the read loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadExit {
    /// EOF, close frame or transport error from the peer side.
    PeerGone,
    /// The hub is shutting down; a close frame is queued.
    Shutdown,
}

/// Drive one accepted connection to completion.
///
/// Teardown runs from a scope guard, so the registry entry is purged even
/// if the task unwinds.
pub(super) async fn serve(
    conn_id: ConnectionId,
    stream: TcpStream,
    addr: SocketAddr,
    shared: Arc<HubShared>,
) {
    // Subscribe before the handshake so a shutdown during it is not missed.
    let mut shutdown_rx = shared.shutdown_tx.subscribe();
    if *shutdown_rx.borrow_and_update() {
        log::debug!("[Hub] Dropping {} ({}): shutting down", conn_id, addr);
        return;
    }

    let accepted = tokio::select! {
        result = ws::accept(stream, shared.config.max_message_size) => result,
        _ = shutdown_rx.changed() => {
            log::debug!(
                "[Hub] Handshake with {} ({}) abandoned: hub is shutting down",
                conn_id,
                addr
            );
            return;
        }
    };
    let (writer, reader) = match accepted {
        Ok(halves) => halves,
        Err(e) => {
            log::warn!("[Hub] Handshake with {} ({}) failed: {e}", conn_id, addr);
            return;
        }
    };

    let (frame_tx, frame_rx) = mpsc::unbounded_channel::<Outbound>();
    shared
        .registry
        .write()
        .expect("PeerRegistry lock poisoned")
        .insert(conn_id.clone(), addr, frame_tx.clone());

    let write_handle = tokio::spawn(ws::write_loop(
        "Hub",
        conn_id.to_string(),
        writer,
        frame_rx,
    ));
    let mut teardown = scopeguard::guard(Some(write_handle), {
        let conn_id = conn_id.clone();
        let shared = Arc::clone(&shared);
        move |write_handle| {
            if let Some(handle) = write_handle {
                handle.abort();
            }
            let removed = shared
                .registry
                .write()
                .expect("PeerRegistry lock poisoned")
                .remove(&conn_id);
            if let Some(record) = removed {
                log::info!(
                    "[Hub] Connection closed: {} ({}, identity: {})",
                    conn_id,
                    record.addr,
                    record.identity.as_deref().unwrap_or("<unregistered>")
                );
            }
        }
    });

    let exit = read_loop(&conn_id, reader, &frame_tx, &shared, shutdown_rx).await;

    if exit == ReadExit::Shutdown {
        if let Some(mut handle) = teardown.take() {
            if tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, &mut handle).await.is_err() {
                log::debug!("[Hub] Close frame to {} not flushed in time", conn_id);
                handle.abort();
            }
        }
    }
}

/// Read loop: decodes text frames and hands them to the hub for dispatch.
///
/// Per-frame errors are logged by the dispatcher and never end the loop;
/// only EOF, a close frame, a transport error or hub shutdown do.
async fn read_loop(
    conn_id: &ConnectionId,
    mut reader: WsReader<TcpStream>,
    frame_tx: &UnboundedSender<Outbound>,
    shared: &Arc<HubShared>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> ReadExit {
    loop {
        let message = tokio::select! {
            message = reader.recv() => message,
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow_and_update() {
                    let _ = frame_tx.send(Outbound::Close("hub shutting down".to_string()));
                    return ReadExit::Shutdown;
                }
                continue;
            }
        };

        match message {
            None => {
                log::info!("[Hub] Peer disconnected: {}", conn_id);
                return ReadExit::PeerGone;
            }
            Some(Ok(WsMessage::Text(text))) => {
                shared.handle_text(conn_id, frame_tx, &text);
            }
            Some(Ok(WsMessage::Binary(data))) => {
                let err = BusError::MalformedEnvelope(format!("{}-byte binary frame", data.len()));
                log_dropped("Hub", conn_id.as_str(), &err);
            }
            Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_))) => {}
            Some(Ok(WsMessage::Close { code, reason })) => {
                log::info!("[Hub] {} sent close ({code}): {reason}", conn_id);
                return ReadExit::PeerGone;
            }
            Some(Err(e)) => {
                log::error!("[Hub] Read error for {}: {e}", conn_id);
                return ReadExit::PeerGone;
            }
        }
    }
}
