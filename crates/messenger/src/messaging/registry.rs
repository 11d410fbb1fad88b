//! Per-messenger listener registry.
//!
//! Maps each channel to an ordered list of listener entries. Dispatch never
//! iterates the live list: it takes a snapshot under the lock and invokes the
//! entries after releasing it, so a listener may add or remove listeners
//! (including itself) without affecting the pass already in progress.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use duplex_protocol::{ChannelName, CorrelationId};
use serde_json::Value;

/// What registered a listener entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ListenerKind {
    /// Persistent listener from `subscribe`
    Subscription,
    /// One-shot waiter for a single correlated response, from `request`
    ResponseWaiter,
    /// Persistent request handler, from `respond`
    Responder,
}

/// The single capability a listener offers: accept one inbound payload.
pub(crate) type Accept = Arc<dyn Fn(&Value, Option<CorrelationId>) + Send + Sync + 'static>;

pub(crate) type ListenerId = u64;

#[derive(Clone)]
pub(crate) struct ListenerEntry {
    id: ListenerId,
    kind: ListenerKind,
    accept: Accept,
}

impl ListenerEntry {
    pub(crate) fn accept(&self, payload: &Value, correlation_id: Option<CorrelationId>) {
        (self.accept)(payload, correlation_id)
    }
}

impl fmt::Debug for ListenerEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerEntry")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Default)]
pub(crate) struct ListenerRegistry {
    channels: HashMap<ChannelName, Vec<ListenerEntry>>,
    next_id: ListenerId,
}

/// Registry as shared between a messenger, its subscriptions and its waiters.
pub(crate) type SharedRegistry = Arc<Mutex<ListenerRegistry>>;

pub(crate) fn lock(registry: &Mutex<ListenerRegistry>) -> MutexGuard<'_, ListenerRegistry> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ListenerRegistry {
    /// Reserve an id before building an entry that needs to know it.
    pub(crate) fn allocate_id(&mut self) -> ListenerId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    pub(crate) fn insert(
        &mut self,
        channel: ChannelName,
        id: ListenerId,
        kind: ListenerKind,
        accept: Accept,
    ) {
        self.channels
            .entry(channel)
            .or_default()
            .push(ListenerEntry { id, kind, accept });
    }

    /// Remove one entry. Returns false if it was not registered (already removed).
    pub(crate) fn remove(&mut self, channel: &str, id: ListenerId) -> bool {
        let Some(listeners) = self.channels.get_mut(channel) else {
            return false;
        };
        let Some(index) = listeners.iter().position(|entry| entry.id == id) else {
            return false;
        };
        listeners.remove(index);
        if listeners.is_empty() {
            self.channels.remove(channel);
        }
        true
    }

    pub(crate) fn contains(&self, channel: &str, id: ListenerId) -> bool {
        self.channels
            .get(channel)
            .is_some_and(|listeners| listeners.iter().any(|entry| entry.id == id))
    }

    /// Listeners for `channel` in registration order, detached from the live list.
    pub(crate) fn snapshot(&self, channel: &str) -> Vec<ListenerEntry> {
        self.channels.get(channel).cloned().unwrap_or_default()
    }

    pub(crate) fn count(&self, channel: &str) -> usize {
        self.channels.get(channel).map_or(0, Vec::len)
    }

    pub(crate) fn count_of(&self, channel: &str, kind: ListenerKind) -> usize {
        self.channels.get(channel).map_or(0, |listeners| {
            listeners.iter().filter(|entry| entry.kind == kind).count()
        })
    }
}

/// Disposer for one registered listener.
///
/// Dropping a `Subscription` does NOT remove the listener. Call `unsubscribe()`
/// explicitly; it is idempotent and only ever removes this exact entry.
#[derive(Clone)]
pub struct Subscription {
    registry: Weak<Mutex<ListenerRegistry>>,
    channel: ChannelName,
    id: ListenerId,
    kind: ListenerKind,
}

impl Subscription {
    pub(crate) fn new(
        registry: &SharedRegistry,
        channel: ChannelName,
        id: ListenerId,
        kind: ListenerKind,
    ) -> Self {
        Self {
            registry: Arc::downgrade(registry),
            channel,
            id,
            kind,
        }
    }

    /// Remove the listener.
    ///
    /// Returns true only for the call that actually removed it; later calls, or
    /// calls after the listener removed itself, do nothing and return false.
    pub fn unsubscribe(&self) -> bool {
        match self.registry.upgrade() {
            Some(registry) => lock(&registry).remove(self.channel.as_str(), self.id),
            None => false,
        }
    }

    /// Whether the listener is still registered.
    pub fn is_active(&self) -> bool {
        self.registry
            .upgrade()
            .is_some_and(|registry| lock(&registry).contains(self.channel.as_str(), self.id))
    }

    pub fn channel(&self) -> &ChannelName {
        &self.channel
    }

    pub fn kind(&self) -> ListenerKind {
        self.kind
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("channel", &self.channel)
            .field("id", &self.id)
            .field("kind", &self.kind)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn noop() -> Accept {
        Arc::new(|_payload: &Value, _id: Option<CorrelationId>| {})
    }

    fn register(registry: &SharedRegistry, channel: &str, kind: ListenerKind) -> Subscription {
        let mut guard = lock(registry);
        let id = guard.allocate_id();
        guard.insert(ChannelName::from(channel), id, kind, noop());
        Subscription::new(registry, ChannelName::from(channel), id, kind)
    }

    #[test]
    fn test_snapshot_keeps_registration_order() {
        let registry = SharedRegistry::default();
        let order = Arc::new(Mutex::new(Vec::new()));
        {
            let mut guard = lock(&registry);
            for n in 0..3 {
                let order = Arc::clone(&order);
                let id = guard.allocate_id();
                guard.insert(
                    ChannelName::from("foo"),
                    id,
                    ListenerKind::Subscription,
                    Arc::new(move |_payload: &Value, _id: Option<CorrelationId>| {
                        order.lock().unwrap().push(n)
                    }),
                );
            }
        }

        for entry in lock(&registry).snapshot("foo") {
            entry.accept(&Value::Null, None);
        }

        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn test_unsubscribe_is_idempotent() {
        let registry = SharedRegistry::default();
        let first = register(&registry, "foo", ListenerKind::Subscription);
        let second = register(&registry, "foo", ListenerKind::Subscription);

        assert!(first.unsubscribe());
        assert!(!first.unsubscribe());
        assert!(!first.is_active());
        assert!(second.is_active());
        assert_eq!(lock(&registry).count("foo"), 1);
    }

    #[test]
    fn test_empty_channel_is_dropped() {
        let registry = SharedRegistry::default();
        let sub = register(&registry, "foo", ListenerKind::Subscription);
        sub.unsubscribe();
        assert!(lock(&registry).channels.is_empty());
    }

    #[test]
    fn test_snapshot_is_detached_from_removal() {
        let registry = SharedRegistry::default();
        let calls = Arc::new(AtomicU32::new(0));
        let later = register(&registry, "foo", ListenerKind::Subscription);
        {
            let mut guard = lock(&registry);
            let id = guard.allocate_id();
            let calls = Arc::clone(&calls);
            guard.insert(
                ChannelName::from("foo"),
                id,
                ListenerKind::Subscription,
                Arc::new(move |_payload: &Value, _id: Option<CorrelationId>| {
                    calls.fetch_add(1, Ordering::SeqCst);
                }),
            );
        }

        let snapshot = lock(&registry).snapshot("foo");
        later.unsubscribe();
        for entry in &snapshot {
            entry.accept(&Value::Null, None);
        }

        assert_eq!(snapshot.len(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(lock(&registry).count("foo"), 1);
    }

    #[test]
    fn test_count_of_kind() {
        let registry = SharedRegistry::default();
        register(&registry, "foo", ListenerKind::Subscription);
        register(&registry, "foo", ListenerKind::Responder);
        register(&registry, "foo", ListenerKind::ResponseWaiter);

        let guard = lock(&registry);
        assert_eq!(guard.count("foo"), 3);
        assert_eq!(guard.count_of("foo", ListenerKind::Responder), 1);
        assert_eq!(guard.count_of("bar", ListenerKind::Responder), 0);
    }

    #[test]
    fn test_unsubscribe_after_registry_dropped() {
        let registry = SharedRegistry::default();
        let sub = register(&registry, "foo", ListenerKind::Subscription);
        drop(registry);
        assert!(!sub.unsubscribe());
        assert!(!sub.is_active());
    }
}
