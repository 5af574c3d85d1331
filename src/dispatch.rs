//! Name-keyed handler tables.
//!
//! One [`HandlerTable`] exists per message kind and endpoint: the hub keeps
//! one for notify handlers and one for request handlers, the peer keeps one
//! for notify handlers. Each entry may carry a source filter naming the only
//! peer identity allowed to trigger it.
//!
//! Registration is last-write-wins per name. [`HandlerTable::register`]
//! returns the handler it displaced so callers can detect collisions.

// Rust guideline compliant 2026-02

use std::collections::HashMap;
use std::sync::Arc;

use crate::envelope::Notify;
use crate::error::{BusError, Result};

/// Callback for incoming notify envelopes.
pub type NotifyHandler = dyn Fn(Notify) + Send + Sync;

struct HandlerEntry<H: ?Sized> {
    handler: Arc<H>,
    source: Option<String>,
}

/// Name → handler mapping with an optional per-entry source filter.
pub struct HandlerTable<H: ?Sized> {
    entries: HashMap<String, HandlerEntry<H>>,
}

impl<H: ?Sized> HandlerTable<H> {
    /// Create an empty table.
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Register `handler` for `name`, replacing any previous handler.
    ///
    /// When `source` is set, only envelopes from that identity match.
    /// Returns the displaced handler, if there was one.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        handler: Arc<H>,
        source: Option<String>,
    ) -> Option<Arc<H>> {
        self.entries
            .insert(name.into(), HandlerEntry { handler, source })
            .map(|old| old.handler)
    }

    /// Remove the handler for `name`.
    pub fn remove(&mut self, name: &str) -> Option<Arc<H>> {
        self.entries.remove(name).map(|entry| entry.handler)
    }

    /// Find the handler for `name` that accepts envelopes from `sender`.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::RoutingMiss`] if nothing is registered under
    /// `name`, or if the registered handler is scoped to another identity.
    pub fn lookup(&self, name: &str, sender: &str) -> Result<Arc<H>> {
        let entry = self
            .entries
            .get(name)
            .ok_or_else(|| BusError::RoutingMiss(format!("no handler registered for '{name}'")))?;

        match entry.source.as_deref() {
            Some(source) if source != sender => Err(BusError::RoutingMiss(format!(
                "handler for '{name}' only accepts '{source}', sender was '{sender}'"
            ))),
            _ => Ok(Arc::clone(&entry.handler)),
        }
    }

    /// Whether a handler is registered under `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Number of registered handlers.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<H: ?Sized> Default for HandlerTable<H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H: ?Sized> std::fmt::Debug for HandlerTable<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&String> = self.entries.keys().collect();
        names.sort();
        f.debug_struct("HandlerTable")
            .field("names", &names)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    type Counter = dyn Fn() -> usize + Send + Sync;

    fn constant(value: usize) -> Arc<Counter> {
        Arc::new(move || value)
    }

    #[test]
    fn test_lookup_unscoped_handler_matches_any_sender() {
        let mut table: HandlerTable<Counter> = HandlerTable::new();
        table.register("log", constant(1), None);

        assert_eq!(table.lookup("log", "ui").unwrap()(), 1);
        assert_eq!(table.lookup("log", "unknown").unwrap()(), 1);
    }

    #[test]
    fn test_lookup_missing_name_is_routing_miss() {
        let table: HandlerTable<Counter> = HandlerTable::new();
        let err = table.lookup("nothing", "ui").err().unwrap();
        assert!(matches!(err, BusError::RoutingMiss(_)));
    }

    #[test]
    fn test_source_filter_rejects_other_senders() {
        let mut table: HandlerTable<Counter> = HandlerTable::new();
        table.register("save", constant(1), Some("editor".to_string()));

        assert!(table.lookup("save", "editor").is_ok());
        assert!(matches!(
            table.lookup("save", "ui").err().unwrap(),
            BusError::RoutingMiss(_)
        ));
        assert!(table.lookup("save", "unknown").is_err());
    }

    #[test]
    fn test_second_registration_replaces_first() {
        let first_calls = Arc::new(AtomicUsize::new(0));
        let calls = Arc::clone(&first_calls);
        let first: Arc<Counter> = Arc::new(move || calls.fetch_add(1, Ordering::SeqCst));

        let mut table: HandlerTable<Counter> = HandlerTable::new();
        assert!(table.register("ping", first, None).is_none());
        let displaced = table.register("ping", constant(99), None);
        assert!(displaced.is_some());

        assert_eq!(table.lookup("ping", "ui").unwrap()(), 99);
        assert_eq!(table.lookup("ping", "ui").unwrap()(), 99);
        assert_eq!(first_calls.load(Ordering::SeqCst), 0);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_rescoping_a_name_replaces_the_filter() {
        let mut table: HandlerTable<Counter> = HandlerTable::new();
        table.register("save", constant(1), Some("editor".to_string()));
        table.register("save", constant(2), None);

        assert_eq!(table.lookup("save", "ui").unwrap()(), 2);
    }

    #[test]
    fn test_remove() {
        let mut table: HandlerTable<Counter> = HandlerTable::new();
        table.register("a", constant(1), None);
        assert!(table.contains("a"));
        assert!(table.remove("a").is_some());
        assert!(table.is_empty());
        assert!(table.remove("a").is_none());
    }
}
