//! Request correlation on the peer side.
//!
//! Every outgoing request gets a fresh id from [`CorrelationTable::allocate`]
//! and an open record shared with the caller's [`RequestHandle`]. Incoming
//! responses are matched by id; a final response removes the record, so a
//! late duplicate becomes a routing miss.
//!
//! A response can arrive before the caller has attached its callbacks.
//! Such responses wait in the record and are delivered in arrival order once
//! the matching callback is attached.
//!
//! A callback that panics is dropped and logged; delivery of the remaining
//! responses carries on.

// Rust guideline compliant 2026-02

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use crate::envelope::Response;
use crate::error::{run_handler, BusError, Result};

type PartialCallback = Box<dyn FnMut(Response) + Send>;
type FinalCallback = Box<dyn FnOnce(Response) + Send>;

#[derive(Default)]
struct Slot {
    on_partial: Option<PartialCallback>,
    on_final: Option<FinalCallback>,
    partials: VecDeque<Response>,
    final_response: Option<Response>,
    finished: bool,
    /// Record was cancelled or purged; nothing is delivered any more.
    abandoned: bool,
    /// Set while a callback runs outside the lock; keeps delivery serial.
    delivering: bool,
}

enum Work {
    Partial(PartialCallback, Response),
    Final(FinalCallback, Response),
}

impl Slot {
    fn next_work(&mut self) -> Option<Work> {
        if let Some(callback) = self.on_partial.take() {
            if let Some(response) = self.partials.pop_front() {
                return Some(Work::Partial(callback, response));
            }
            self.on_partial = Some(callback);
        }

        // A final waits behind buffered partials only while a partial callback is attached.
        if self.partials.is_empty() || self.on_partial.is_none() {
            if let (Some(_), Some(_)) = (&self.on_final, &self.final_response) {
                let callback = self.on_final.take()?;
                let response = self.final_response.take()?;
                self.finished = true;
                return Some(Work::Final(callback, response));
            }
        }
        None
    }
}

/// Caller-side handle for one outstanding request.
///
/// Cloning yields another handle to the same request.
#[derive(Clone)]
pub struct RequestHandle {
    request_id: u64,
    slot: Arc<Mutex<Slot>>,
}

impl RequestHandle {
    fn new(request_id: u64) -> Self {
        Self {
            request_id,
            slot: Arc::new(Mutex::new(Slot::default())),
        }
    }

    /// Correlation id carried by the request envelope.
    pub fn request_id(&self) -> u64 {
        self.request_id
    }

    /// Invoke `callback` for each non-final response.
    ///
    /// Replaces any earlier partial callback. Partials received before this
    /// call are delivered immediately, oldest first.
    pub fn on_partial<F>(&self, callback: F) -> &Self
    where
        F: FnMut(Response) + Send + 'static,
    {
        {
            let mut slot = self.slot.lock().expect("RequestHandle slot poisoned");
            if slot.abandoned {
                log::debug!(
                    "[Peer] [request {}] abandoned, on_partial ignored",
                    self.request_id
                );
                return self;
            }
            slot.on_partial = Some(Box::new(callback));
        }
        self.drain();
        self
    }

    /// Invoke `callback` once, for the final response.
    ///
    /// If the final response already arrived it is delivered immediately.
    pub fn on_final<F>(&self, callback: F) -> &Self
    where
        F: FnOnce(Response) + Send + 'static,
    {
        {
            let mut slot = self.slot.lock().expect("RequestHandle slot poisoned");
            if slot.finished || slot.abandoned {
                log::debug!(
                    "[Peer] [request {}] no longer open, on_final ignored",
                    self.request_id
                );
                return self;
            }
            slot.on_final = Some(Box::new(callback));
        }
        self.drain();
        self
    }

    /// Whether the final response has been handed to `on_final`.
    pub fn is_finished(&self) -> bool {
        self.slot.lock().expect("RequestHandle slot poisoned").finished
    }

    /// Buffer `response` and deliver whatever the attached callbacks allow.
    pub(crate) fn deliver(&self, response: Response) {
        {
            let mut slot = self.slot.lock().expect("RequestHandle slot poisoned");
            if slot.abandoned {
                return;
            }
            if response.is_final {
                slot.final_response = Some(response);
            } else {
                slot.partials.push_back(response);
            }
        }
        self.drain();
    }

    /// Run pending callbacks without holding the lock while they execute.
    fn drain(&self) {
        {
            let mut slot = self.slot.lock().expect("RequestHandle slot poisoned");
            if slot.delivering {
                // The thread already delivering picks up the new work.
                return;
            }
            slot.delivering = true;
        }

        loop {
            let work = {
                let mut slot = self.slot.lock().expect("RequestHandle slot poisoned");
                let work = slot.next_work();
                if work.is_none() {
                    slot.delivering = false;
                }
                work
            };

            match work {
                None => break,
                Some(Work::Partial(mut callback, response)) => {
                    match run_handler("on_partial", || callback(response)) {
                        Ok(()) => {
                            let mut slot = self.slot.lock().expect("RequestHandle slot poisoned");
                            if slot.on_partial.is_none() && !slot.abandoned {
                                slot.on_partial = Some(callback);
                            }
                        }
                        Err(e) => {
                            log::warn!(
                                "[Peer] [request {}] {e}; partial callback dropped",
                                self.request_id
                            );
                        }
                    }
                }
                Some(Work::Final(callback, response)) => {
                    if let Err(e) = run_handler("on_final", move || callback(response)) {
                        log::warn!("[Peer] [request {}] {e}", self.request_id);
                    }
                }
            }
        }
    }

    /// Close the record for good, dropping callbacks and buffered responses.
    ///
    /// Callbacks are dropped outside the lock, so anything they own (a channel
    /// sender, say) is released and its receiver sees the request end.
    pub(crate) fn abandon(&self) {
        let callbacks = {
            let mut slot = self.slot.lock().expect("RequestHandle slot poisoned");
            slot.abandoned = true;
            slot.partials.clear();
            slot.final_response = None;
            (slot.on_partial.take(), slot.on_final.take())
        };
        drop(callbacks);
    }
}

impl std::fmt::Debug for RequestHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let slot = self.slot.lock().expect("RequestHandle slot poisoned");
        f.debug_struct("RequestHandle")
            .field("request_id", &self.request_id)
            .field("buffered_partials", &slot.partials.len())
            .field("finished", &slot.finished)
            .finish()
    }
}

/// Open requests of one peer, keyed by request id.
#[derive(Debug)]
pub(crate) struct CorrelationTable {
    next_id: u64,
    open: HashMap<u64, RequestHandle>,
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            open: HashMap::new(),
        }
    }

    /// Open a record under the next request id.
    ///
    /// Ids start at 1 and strictly increase; a cancelled id is never reused.
    pub fn allocate(&mut self) -> RequestHandle {
        let handle = RequestHandle::new(self.next_id);
        self.next_id += 1;
        self.open.insert(handle.request_id, handle.clone());
        handle
    }

    /// Find the record `response` belongs to, closing it on a final response.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::RoutingMiss`] if no record is open for the id.
    pub fn resolve(&mut self, response: &Response) -> Result<RequestHandle> {
        let id = response.request_id;
        let handle = if response.is_final {
            self.open.remove(&id)
        } else {
            self.open.get(&id).cloned()
        };
        handle.ok_or_else(|| BusError::RoutingMiss(format!("no outstanding request {id}")))
    }

    /// Take the record for `request_id` out of the table.
    ///
    /// The caller abandons the returned handle once the table lock is released.
    pub fn remove(&mut self, request_id: u64) -> Option<RequestHandle> {
        self.open.remove(&request_id)
    }

    /// Take every record out of the table; their final callbacks never run.
    pub fn purge(&mut self) -> Vec<RequestHandle> {
        self.open.drain().map(|(_, handle)| handle).collect()
    }

    /// Open request ids, ascending.
    pub fn ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.open.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn contains(&self, request_id: u64) -> bool {
        self.open.contains_key(&request_id)
    }
}
