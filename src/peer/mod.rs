//! Peer endpoint: one named connection to a hub.
//!
//! A [`Peer`] owns a single WebSocket connection. After the handshake it
//! sends its registration envelope, then runs two tasks:
//!
//! ```text
//! Peer ──notify()/request()──► Outbound queue ──► write loop ──► hub
//!   ▲                                                             │
//!   └── notify handlers / RequestHandle ◄── read loop ◄───────────┘
//! ```
//!
//! Handlers and response callbacks run on the read task; keep them short.
//! A handler that panics is logged and the read task carries on.

// Rust guideline compliant 2026-02

mod correlation;

pub use correlation::RequestHandle;

use std::sync::{Arc, Mutex, RwLock, Weak};

use serde_json::Value;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::dispatch::{HandlerTable, NotifyHandler};
use crate::envelope::{Envelope, Notify, Registration, Request, HUB_ID};
use crate::error::{log_dropped, run_handler, BusError, Result};
use crate::ws::{self, ClientStream, Outbound, WsMessage, WsReader};
use correlation::CorrelationTable;

/// Callback run once the peer has registered with the hub.
pub type ConnectCallback = dyn Fn() + Send + Sync;

/// Connection state of a [`Peer`].
///
/// `Disconnected → Connecting → Open → Registered → Closed`. A failed
/// connect falls back to `Disconnected`; `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// Not connected.
    #[default]
    Disconnected,
    /// WebSocket handshake in progress.
    Connecting,
    /// Transport open, registration not yet sent.
    Open,
    /// Registration sent; notifies and requests may flow.
    Registered,
    /// Connection closed; the peer cannot be reused.
    Closed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Registered => "registered",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// The peer side of the bus.
///
/// Cheap to clone; clones share the connection, handlers and open requests.
/// The connection is torn down when the last clone is dropped.
#[derive(Clone)]
pub struct Peer {
    inner: Arc<PeerInner>,
}

struct PeerInner {
    identity: String,
    config: Config,
    state: Mutex<ConnectionState>,
    outbound: Mutex<Option<UnboundedSender<Outbound>>>,
    correlations: Mutex<CorrelationTable>,
    notify_handlers: RwLock<HandlerTable<NotifyHandler>>,
    connect_callbacks: Mutex<Vec<Arc<ConnectCallback>>>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
}

impl Peer {
    /// Create a disconnected peer that will register as `identity`.
    pub fn new(identity: impl Into<String>) -> Self {
        Self::with_config(identity, Config::default())
    }

    /// Create a disconnected peer with the given configuration.
    pub fn with_config(identity: impl Into<String>, config: Config) -> Self {
        Self {
            inner: Arc::new(PeerInner {
                identity: identity.into(),
                config,
                state: Mutex::new(ConnectionState::Disconnected),
                outbound: Mutex::new(None),
                correlations: Mutex::new(CorrelationTable::new()),
                notify_handlers: RwLock::new(HandlerTable::new()),
                connect_callbacks: Mutex::new(Vec::new()),
                reader_task: Mutex::new(None),
            }),
        }
    }

    /// Identity this peer registers under.
    pub fn identity(&self) -> &str {
        &self.inner.identity
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.lock().expect("Peer state mutex poisoned")
    }

    /// Connect to the hub at `address` and register.
    ///
    /// `address` is `host:port` or a full `ws://` URL. Registered
    /// on-connect callbacks run after the registration envelope is sent.
    ///
    /// # Errors
    ///
    /// - [`BusError::AlreadyConnected`] unless the peer is `Disconnected`.
    /// - [`BusError::Connection`] if the transport cannot be established;
    ///   the peer returns to `Disconnected` and may try again.
    pub async fn connect(&self, address: &str) -> Result<()> {
        self.inner
            .transition(ConnectionState::Disconnected, ConnectionState::Connecting)
            .map_err(|state| BusError::AlreadyConnected(state.to_string()))?;

        log::info!(
            "[Peer] '{}' connecting to {}",
            self.inner.identity,
            ws::hub_url(address)
        );
        let connected = ws::connect(address, self.inner.config.max_message_size).await;
        let (mut writer, reader) = match connected {
            Ok(halves) => halves,
            Err(e) => {
                let _ = self
                    .inner
                    .transition(ConnectionState::Connecting, ConnectionState::Disconnected);
                return Err(e);
            }
        };
        self.inner
            .transition(ConnectionState::Connecting, ConnectionState::Open)
            .map_err(|state| {
                BusError::Connection(format!("peer became {state} while connecting"))
            })?;

        let registration = Envelope::Registration(Registration::new(self.inner.identity.as_str()));
        if let Err(e) = writer.send_text(&registration.to_text()).await {
            let _ = self
                .inner
                .transition(ConnectionState::Open, ConnectionState::Disconnected);
            return Err(e);
        }

        let (frame_tx, frame_rx) = mpsc::unbounded_channel::<Outbound>();
        *self.inner.outbound.lock().expect("Peer outbound mutex poisoned") = Some(frame_tx);
        if let Err(state) = self
            .inner
            .transition(ConnectionState::Open, ConnectionState::Registered)
        {
            self.inner
                .outbound
                .lock()
                .expect("Peer outbound mutex poisoned")
                .take();
            return Err(BusError::Connection(format!(
                "peer became {state} while registering"
            )));
        }

        tokio::spawn(ws::write_loop(
            "Peer",
            self.inner.identity.clone(),
            writer,
            frame_rx,
        ));
        let reader_task = tokio::spawn(read_loop(Arc::downgrade(&self.inner), reader));
        *self.inner.reader_task.lock().expect("Peer reader mutex poisoned") = Some(reader_task);

        log::info!("[Peer] '{}' registered", self.inner.identity);

        let callbacks: Vec<Arc<ConnectCallback>> = self
            .inner
            .connect_callbacks
            .lock()
            .expect("Peer connect callbacks mutex poisoned")
            .clone();
        for callback in callbacks {
            callback();
        }
        Ok(())
    }

    /// Send a fire-and-forget notify.
    ///
    /// `target` names another peer; `None` addresses the hub.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::NotConnected`] unless the peer is `Registered`.
    pub fn notify(&self, name: &str, payload: Value, target: Option<&str>) -> Result<()> {
        let notify = Notify::new(
            name,
            payload,
            self.inner.identity.as_str(),
            target.map(str::to_string),
        );
        self.inner.send(Envelope::Notify(notify))?;
        log::debug!("[Peer] [notify {}] -> {}", name, target.unwrap_or(HUB_ID));
        Ok(())
    }

    /// Send a request and return its handle without waiting.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::NotConnected`] unless the peer is `Registered`.
    pub fn request(&self, name: &str, payload: Value) -> Result<RequestHandle> {
        self.inner.ensure_registered()?;

        let handle = self
            .inner
            .correlations
            .lock()
            .expect("CorrelationTable mutex poisoned")
            .allocate();
        let request_id = handle.request_id();
        let request = Request::new(name, payload, request_id, self.inner.identity.as_str());

        if let Err(e) = self.inner.send(Envelope::Request(request)) {
            let removed = self
                .inner
                .correlations
                .lock()
                .expect("CorrelationTable mutex poisoned")
                .remove(request_id);
            if let Some(removed) = removed {
                removed.abandon();
            }
            return Err(e);
        }
        log::debug!("[Peer] [request {} {}] -> {}", request_id, name, HUB_ID);
        Ok(handle)
    }

    /// Register the handler for incoming notifies named `name`.
    ///
    /// Replaces any previous handler for `name` and returns it.
    pub fn on_notify<F>(&self, name: &str, handler: F) -> Option<Arc<NotifyHandler>>
    where
        F: Fn(Notify) + Send + Sync + 'static,
    {
        let handler: Arc<NotifyHandler> = Arc::new(handler);
        self.inner
            .notify_handlers
            .write()
            .expect("notify handler lock poisoned")
            .register(name, handler, None)
    }

    /// Add a callback to run after each successful registration.
    pub fn on_connect<F>(&self, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner
            .connect_callbacks
            .lock()
            .expect("Peer connect callbacks mutex poisoned")
            .push(Arc::new(callback));
    }

    /// Forget request `request_id` locally.
    ///
    /// Later responses for it are routing misses and its callbacks are
    /// dropped. The hub is not told. Returns whether the request was
    /// outstanding.
    pub fn cancel(&self, request_id: u64) -> bool {
        let removed = self
            .inner
            .correlations
            .lock()
            .expect("CorrelationTable mutex poisoned")
            .remove(request_id);
        match removed {
            Some(handle) => {
                handle.abandon();
                log::debug!("[Peer] [request {}] cancelled", request_id);
                true
            }
            None => false,
        }
    }

    /// Ids of requests still waiting for their final response, ascending.
    pub fn outstanding_requests(&self) -> Vec<u64> {
        self.inner
            .correlations
            .lock()
            .expect("CorrelationTable mutex poisoned")
            .ids()
    }

    /// Whether `request_id` is still waiting for its final response.
    pub fn is_outstanding(&self, request_id: u64) -> bool {
        self.inner
            .correlations
            .lock()
            .expect("CorrelationTable mutex poisoned")
            .contains(request_id)
    }

    /// Close the connection. The peer becomes `Closed` for good.
    pub fn close(&self) {
        let previous = std::mem::replace(
            &mut *self.inner.state.lock().expect("Peer state mutex poisoned"),
            ConnectionState::Closed,
        );
        if previous == ConnectionState::Closed {
            return;
        }

        let outbound = self
            .inner
            .outbound
            .lock()
            .expect("Peer outbound mutex poisoned")
            .take();
        if let Some(tx) = outbound {
            let _ = tx.send(Outbound::Close("peer closing".to_string()));
        }
        let reader_task = self
            .inner
            .reader_task
            .lock()
            .expect("Peer reader mutex poisoned")
            .take();
        if let Some(task) = reader_task {
            task.abort();
        }
        self.inner.purge_requests();
        log::info!("[Peer] '{}' closed", self.inner.identity);
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("identity", &self.inner.identity)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl PeerInner {
    /// Move from `from` to `to`, or report the state actually found.
    fn transition(
        &self,
        from: ConnectionState,
        to: ConnectionState,
    ) -> std::result::Result<(), ConnectionState> {
        let mut state = self.state.lock().expect("Peer state mutex poisoned");
        if *state != from {
            return Err(*state);
        }
        *state = to;
        Ok(())
    }

    fn ensure_registered(&self) -> Result<()> {
        let state = *self.state.lock().expect("Peer state mutex poisoned");
        if state == ConnectionState::Registered {
            Ok(())
        } else {
            Err(BusError::NotConnected(state.to_string()))
        }
    }

    fn send(&self, envelope: Envelope) -> Result<()> {
        self.ensure_registered()?;
        let tx = self
            .outbound
            .lock()
            .expect("Peer outbound mutex poisoned")
            .clone()
            .ok_or_else(|| BusError::NotConnected(ConnectionState::Closed.to_string()))?;
        tx.send(Outbound::Text(envelope.to_text()))
            .map_err(|e| BusError::NotConnected(format!("write queue closed: {e}")))
    }

    /// Drop every open request. Callbacks are released after the table
    /// lock, so their owners observe the end of the request.
    fn purge_requests(&self) {
        let purged = self
            .correlations
            .lock()
            .expect("CorrelationTable mutex poisoned")
            .purge();
        if purged.is_empty() {
            return;
        }
        log::debug!(
            "[Peer] '{}' dropped {} outstanding request(s)",
            self.identity,
            purged.len()
        );
        for handle in purged {
            handle.abandon();
        }
    }

    /// Decode and route one text frame from the hub.
    fn handle_text(&self, text: &str) {
        let result = Envelope::from_text(text).and_then(|envelope| self.route(envelope));
        if let Err(e) = result {
            log_dropped("Peer", HUB_ID, &e);
        }
    }

    fn route(&self, envelope: Envelope) -> Result<()> {
        match envelope {
            Envelope::Notify(notify) => {
                log::debug!("[Peer] [notify {}] <- {}", notify.name, notify.sender_id);
                let handler = self
                    .notify_handlers
                    .read()
                    .expect("notify handler lock poisoned")
                    .lookup(&notify.name, &notify.sender_id)?;
                let what = format!("notify '{}' from {}", notify.name, notify.sender_id);
                run_handler(&what, move || handler(notify))
            }
            Envelope::Response(response) => {
                let handle = self
                    .correlations
                    .lock()
                    .expect("CorrelationTable mutex poisoned")
                    .resolve(&response)?;
                handle.deliver(response);
                Ok(())
            }
            Envelope::Request(request) => Err(BusError::RoutingMiss(format!(
                "peers do not serve requests ('{}')",
                request.name
            ))),
            Envelope::Registration(_) => Err(BusError::RoutingMiss(
                "peers do not accept registrations".to_string(),
            )),
        }
    }

    /// Connection ended from the hub side or by a transport error.
    fn teardown(&self) {
        let previous = std::mem::replace(
            &mut *self.state.lock().expect("Peer state mutex poisoned"),
            ConnectionState::Closed,
        );
        self.outbound.lock().expect("Peer outbound mutex poisoned").take();
        self.purge_requests();
        if previous != ConnectionState::Closed {
            log::info!("[Peer] '{}' disconnected from hub", self.identity);
        }
    }
}

impl Drop for PeerInner {
    fn drop(&mut self) {
        if let Ok(mut slot) = self.reader_task.lock() {
            if let Some(task) = slot.take() {
                task.abort();
            }
        }
    }
}

/// Read loop. Runs until the hub goes away or the peer is dropped.
///
/// Teardown runs on every exit, unwinding included.
async fn read_loop(inner: Weak<PeerInner>, mut reader: WsReader<ClientStream>) {
    let _teardown = scopeguard::guard(Weak::clone(&inner), |inner| {
        if let Some(peer) = inner.upgrade() {
            peer.teardown();
        }
    });

    loop {
        let message = reader.recv().await;
        let Some(peer) = inner.upgrade() else {
            return;
        };

        match message {
            None => {
                log::info!("[Peer] '{}' connection closed by hub", peer.identity);
                break;
            }
            Some(Ok(WsMessage::Text(text))) => peer.handle_text(&text),
            Some(Ok(WsMessage::Binary(data))) => {
                let err =
                    BusError::MalformedEnvelope(format!("{}-byte binary frame", data.len()));
                log_dropped("Peer", HUB_ID, &err);
            }
            Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_))) => {}
            Some(Ok(WsMessage::Close { code, reason })) => {
                log::info!(
                    "[Peer] '{}' hub sent close ({code}): {reason}",
                    peer.identity
                );
                break;
            }
            Some(Err(e)) => {
                log::error!("[Peer] '{}' read error: {e}", peer.identity);
                break;
            }
        }
    }
}
