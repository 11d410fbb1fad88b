//! In-process loopback transport.
//!
//! `pair()` returns two connected endpoints. Sending on one side delivers the
//! envelope, as a raw JSON value, to every dispatch callback registered on the
//! other side before `send` returns.

use std::sync::{Arc, Mutex, PoisonError};

use duplex_protocol::Envelope;
use serde_json::Value;

use super::{Dispatch, Transport};

/// Dispatch callbacks registered on one side of the pair.
#[derive(Clone, Default)]
struct Inbox {
    dispatchers: Arc<Mutex<Vec<Dispatch>>>,
}

impl Inbox {
    fn register(&self, dispatch: Dispatch) {
        self.dispatchers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(dispatch);
    }

    fn deliver(&self, raw: Value) {
        // Snapshot so a callback may register further listeners without deadlocking.
        let dispatchers = self
            .dispatchers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for dispatch in &dispatchers {
            dispatch(raw.clone());
        }
    }

    fn len(&self) -> usize {
        self.dispatchers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// One endpoint of an in-memory duplex pair.
#[derive(Clone)]
pub struct MemoryTransport {
    inbox: Inbox,
    peer: Inbox,
}

/// Create two connected endpoints.
pub fn pair() -> (MemoryTransport, MemoryTransport) {
    let left = Inbox::default();
    let right = Inbox::default();
    (
        MemoryTransport {
            inbox: left.clone(),
            peer: right.clone(),
        },
        MemoryTransport {
            inbox: right,
            peer: left,
        },
    )
}

impl MemoryTransport {
    /// Deliver an arbitrary raw value to this endpoint's own listeners, as if the
    /// peer had sent it.
    pub fn inject(&self, raw: Value) {
        self.inbox.deliver(raw);
    }

    /// Number of dispatch callbacks registered on this endpoint.
    pub fn listener_count(&self) -> usize {
        self.inbox.len()
    }
}

impl Transport for MemoryTransport {
    fn send(&self, envelope: Envelope) {
        self.peer.deliver(envelope.to_value());
    }

    fn add_listener(&self, dispatch: Dispatch) {
        self.inbox.register(dispatch);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_send_reaches_the_other_side_only() {
        let (left, right) = pair();
        let left_seen = Arc::new(Mutex::new(Vec::new()));
        let right_seen = Arc::new(Mutex::new(Vec::new()));

        let seen = Arc::clone(&left_seen);
        left.add_listener(Arc::new(move |raw: Value| seen.lock().unwrap().push(raw)));
        let seen = Arc::clone(&right_seen);
        right.add_listener(Arc::new(move |raw: Value| seen.lock().unwrap().push(raw)));

        left.send(Envelope::publish("foo", json!("bar")));

        assert!(left_seen.lock().unwrap().is_empty());
        assert_eq!(
            *right_seen.lock().unwrap(),
            vec![json!({"channel": "foo", "payload": "bar"})]
        );
    }

    #[test]
    fn test_inject_delivers_locally() {
        let (left, _right) = pair();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        left.add_listener(Arc::new(move |raw: Value| seen_clone.lock().unwrap().push(raw)));

        left.inject(json!(42));

        assert_eq!(*seen.lock().unwrap(), vec![json!(42)]);
        assert_eq!(left.listener_count(), 1);
    }
}
