//! Hub endpoint: accepts peer connections and routes their envelopes.
//!
//! # Architecture
//!
//! ```text
//! Hub                                   Peer processes
//! ┌──────────────────────┐              ┌──────────┐
//! │ accept loop          │◄── ws:// ────│ Peer "ui"│
//! │  └ serve() per conn  │◄── ws:// ────│ Peer "x" │
//! │      read loop ──────┼─► handle_text ─► HandlerTable (notify / request)
//! │      write loop ◄────┼── Outbound queue ◄── Responder / Hub::notify
//! │ PeerRegistry         │
//! └──────────────────────┘
//! ```
//!
//! Registry and handler tables sit behind `std::sync::RwLock`s shared by
//! every connection task. Guards are released before any handler runs, so
//! handlers may register other handlers or send notifies.

// Rust guideline compliant 2026-02

mod connection;
mod registry;
mod responder;

pub use registry::ConnectionId;
pub use responder::{RequestHandler, Responder};

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, RwLock};

use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::dispatch::{HandlerTable, NotifyHandler};
use crate::envelope::{Envelope, Notify, Registration, Request, HUB_ID, UNKNOWN_SENDER};
use crate::error::{log_dropped, run_handler, BusError, Result};
use crate::ws::Outbound;
use registry::PeerRegistry;

/// The hub side of the bus.
///
/// Cheap to clone; clones share the same listener, registry and handlers.
#[derive(Debug, Clone)]
pub struct Hub {
    shared: Arc<HubShared>,
}

#[derive(Debug)]
struct Listening {
    addr: SocketAddr,
    accept_handle: JoinHandle<()>,
}

/// State shared between the hub handle and its connection tasks.
#[derive(Debug)]
pub(crate) struct HubShared {
    config: Config,
    registry: RwLock<PeerRegistry>,
    notify_handlers: RwLock<HandlerTable<NotifyHandler>>,
    request_handlers: RwLock<HandlerTable<RequestHandler>>,
    shutdown_tx: watch::Sender<bool>,
    listener: Mutex<Option<Listening>>,
}

impl Hub {
    /// Create a hub with default configuration.
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    /// Create a hub with the given configuration.
    pub fn with_config(config: Config) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            shared: Arc::new(HubShared {
                config,
                registry: RwLock::new(PeerRegistry::new()),
                notify_handlers: RwLock::new(HandlerTable::new()),
                request_handlers: RwLock::new(HandlerTable::new()),
                shutdown_tx,
                listener: Mutex::new(None),
            }),
        }
    }

    /// Configuration this hub was built with.
    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    /// Start listening on the configured `bind_address`.
    ///
    /// # Errors
    ///
    /// See [`Hub::start`].
    pub async fn listen(&self) -> Result<SocketAddr> {
        let bind_address = self.shared.config.bind_address.clone();
        self.start(&bind_address).await
    }

    /// Start listening on `bind_address` and return the address actually bound.
    ///
    /// Use port 0 for an ephemeral port; peers learn the real port from the
    /// returned address.
    ///
    /// # Errors
    ///
    /// - [`BusError::Bind`] if the address cannot be bound.
    /// - [`BusError::AlreadyStarted`] if the hub is already listening.
    pub async fn start(&self, bind_address: &str) -> Result<SocketAddr> {
        if let Some(addr) = self.local_addr() {
            return Err(BusError::AlreadyStarted(addr.to_string()));
        }

        let bind_error = |e: std::io::Error| BusError::Bind {
            address: bind_address.to_string(),
            reason: e.to_string(),
        };
        let listener = TcpListener::bind(bind_address).await.map_err(bind_error)?;
        let addr = listener.local_addr().map_err(bind_error)?;

        let mut slot = self.shared.listener.lock().expect("Hub listener mutex poisoned");
        if let Some(existing) = slot.as_ref() {
            return Err(BusError::AlreadyStarted(existing.addr.to_string()));
        }
        // A hub restarted after shutdown serves new connections again.
        self.shared.shutdown_tx.send_replace(false);
        let accept_handle = tokio::spawn(accept_loop(listener, Arc::clone(&self.shared)));
        *slot = Some(Listening {
            addr,
            accept_handle,
        });

        log::info!("[Hub] Listening on ws://{}", addr);
        Ok(addr)
    }

    /// Address the hub is listening on, if started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared
            .listener
            .lock()
            .expect("Hub listener mutex poisoned")
            .as_ref()
            .map(|listening| listening.addr)
    }

    /// Send a notify to one peer, or to every registered peer when `target`
    /// is `None`.
    ///
    /// A broadcast goes to the peers registered at the moment of the call.
    /// A targeted notify to an unknown identity is logged as
    /// [`BusError::UnknownPeer`] and dropped. Returns how many peers the
    /// notify was queued for.
    pub fn notify(&self, name: &str, payload: Value, target: Option<&str>) -> usize {
        let recipients = {
            let registry = self.shared.registry.read().expect("PeerRegistry lock poisoned");
            match target {
                None => registry.registered(),
                Some(identity) => match registry.sender_for(identity) {
                    Some(tx) => vec![(identity.to_string(), tx)],
                    None => Vec::new(),
                },
            }
        };

        if let (Some(identity), true) = (target, recipients.is_empty()) {
            let err = BusError::UnknownPeer(identity.to_string());
            log::warn!("[Hub] [notify {}] dropped: {}", name, err);
            return 0;
        }

        let mut delivered = 0;
        for (identity, tx) in recipients {
            let notify = Notify::new(name, payload.clone(), HUB_ID, Some(identity.clone()));
            if tx.send(Outbound::Text(Envelope::Notify(notify).to_text())).is_ok() {
                log::debug!("[Hub] [notify {}] -> {}", name, identity);
                delivered += 1;
            }
        }
        delivered
    }

    /// Register the handler for notifies named `name`.
    ///
    /// With `source` set, only notifies from that peer identity reach the
    /// handler. Replaces any previous handler for `name` and returns it.
    pub fn on_notify<F>(
        &self,
        name: &str,
        handler: F,
        source: Option<&str>,
    ) -> Option<Arc<NotifyHandler>>
    where
        F: Fn(Notify) + Send + Sync + 'static,
    {
        let handler: Arc<NotifyHandler> = Arc::new(handler);
        self.shared
            .notify_handlers
            .write()
            .expect("notify handler lock poisoned")
            .register(name, handler, source.map(str::to_string))
    }

    /// Register the handler for requests named `name`.
    ///
    /// The handler receives the request and a [`Responder`] bound to it.
    /// Source filtering and replacement work as in [`Hub::on_notify`].
    pub fn on_request<F>(
        &self,
        name: &str,
        handler: F,
        source: Option<&str>,
    ) -> Option<Arc<RequestHandler>>
    where
        F: Fn(Request, Responder) + Send + Sync + 'static,
    {
        let handler: Arc<RequestHandler> = Arc::new(handler);
        self.shared
            .request_handlers
            .write()
            .expect("request handler lock poisoned")
            .register(name, handler, source.map(str::to_string))
    }

    /// Identities of the currently registered peers, sorted.
    pub fn peers(&self) -> Vec<String> {
        self.shared
            .registry
            .read()
            .expect("PeerRegistry lock poisoned")
            .identities()
    }

    /// Number of live connections, registered or not.
    pub fn connection_count(&self) -> usize {
        self.shared
            .registry
            .read()
            .expect("PeerRegistry lock poisoned")
            .connection_count()
    }

    /// Stop accepting connections and close every live connection.
    pub fn shutdown(&self) {
        if let Some(listening) = self
            .shared
            .listener
            .lock()
            .expect("Hub listener mutex poisoned")
            .take()
        {
            listening.accept_handle.abort();
            log::info!("[Hub] Stopped listening on {}", listening.addr);
        }
        self.shared.shutdown_tx.send_replace(true);
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}

/// Accept loop — runs as a tokio task until the hub shuts down.
async fn accept_loop(listener: TcpListener, shared: Arc<HubShared>) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let conn_id = ConnectionId::generate();
                log::info!("[Hub] Connection accepted: {} from {}", conn_id, addr);
                let shared = Arc::clone(&shared);
                tokio::spawn(connection::serve(conn_id, stream, addr, shared));
            }
            Err(e) => {
                log::error!("[Hub] Accept error: {e}");
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            }
        }
    }
}

impl HubShared {
    /// Decode and route one text frame received on `conn_id`.
    ///
    /// Every failure is logged here; nothing propagates into the read loop.
    fn handle_text(
        &self,
        conn_id: &ConnectionId,
        frame_tx: &UnboundedSender<Outbound>,
        text: &str,
    ) {
        let result = Envelope::from_text(text)
            .and_then(|envelope| self.route(conn_id, frame_tx, envelope));
        if let Err(e) = result {
            log_dropped("Hub", conn_id.as_str(), &e);
        }
    }

    fn route(
        &self,
        conn_id: &ConnectionId,
        frame_tx: &UnboundedSender<Outbound>,
        envelope: Envelope,
    ) -> Result<()> {
        match envelope {
            Envelope::Registration(registration) => self.admit(conn_id, frame_tx, &registration),
            Envelope::Notify(notify) => self.dispatch_notify(conn_id, notify),
            Envelope::Request(request) => self.dispatch_request(conn_id, frame_tx, request),
            Envelope::Response(response) => Err(BusError::RoutingMiss(format!(
                "hub has no outstanding request {}",
                response.request_id
            ))),
        }
    }

    /// Identity registered on `conn_id`, or `unknown` before registration.
    fn sender_identity(&self, conn_id: &ConnectionId) -> String {
        self.registry
            .read()
            .expect("PeerRegistry lock poisoned")
            .identity_of(conn_id)
            .unwrap_or(UNKNOWN_SENDER)
            .to_string()
    }

    fn admit(
        &self,
        conn_id: &ConnectionId,
        frame_tx: &UnboundedSender<Outbound>,
        registration: &Registration,
    ) -> Result<()> {
        let identity = registration.identity().unwrap_or_default();
        let outcome = self
            .registry
            .write()
            .expect("PeerRegistry lock poisoned")
            .register(conn_id, identity);

        match outcome {
            Ok(true) => {
                log::info!("[Hub] Peer registered: '{}' on {}", identity, conn_id);
                Ok(())
            }
            Ok(false) => Ok(()),
            Err(e) => {
                let _ = frame_tx.send(Outbound::Close(e.to_string()));
                Err(e)
            }
        }
    }

    fn dispatch_notify(&self, conn_id: &ConnectionId, notify: Notify) -> Result<()> {
        let sender = self.sender_identity(conn_id);

        if self.config.relay_targeted_notify {
            if let Some(target) = notify.target_id.as_deref().filter(|t| *t != HUB_ID) {
                return self.relay(&sender, target, &notify);
            }
        }

        log::debug!("[Hub] [notify {}] <- {} ({})", notify.name, sender, conn_id);
        let handler = self
            .notify_handlers
            .read()
            .expect("notify handler lock poisoned")
            .lookup(&notify.name, &sender)?;
        let what = format!("notify '{}' from {}", notify.name, sender);
        run_handler(&what, move || handler(notify))
    }

    /// Forward a peer's targeted notify to the addressed peer.
    fn relay(&self, sender: &str, target: &str, notify: &Notify) -> Result<()> {
        let tx = self
            .registry
            .read()
            .expect("PeerRegistry lock poisoned")
            .sender_for(target)
            .ok_or_else(|| BusError::UnknownPeer(target.to_string()))?;

        let text = Envelope::Notify(notify.clone()).to_text();
        if tx.send(Outbound::Text(text)).is_err() {
            return Err(BusError::UnknownPeer(target.to_string()));
        }
        log::debug!(
            "[Hub] [notify {}] relayed {} -> {}",
            notify.name,
            sender,
            target
        );
        Ok(())
    }

    fn dispatch_request(
        &self,
        conn_id: &ConnectionId,
        frame_tx: &UnboundedSender<Outbound>,
        request: Request,
    ) -> Result<()> {
        let sender = self.sender_identity(conn_id);
        log::debug!(
            "[Hub] [request {} {}] <- {} ({})",
            request.request_id,
            request.name,
            sender,
            conn_id
        );

        let handler = self
            .request_handlers
            .read()
            .expect("request handler lock poisoned")
            .lookup(&request.name, &sender)?;
        let responder = Responder::new(
            request.request_id,
            conn_id.clone(),
            sender,
            frame_tx.clone(),
        );
        let what = format!("request '{}' from {}", request.name, responder.peer());
        run_handler(&what, move || handler(request, responder))
    }
}
