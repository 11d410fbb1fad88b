//! The duplex messenger.
//!
//! A `Messenger` is bound to one transport for its whole life. It provides:
//! - `publish` / `subscribe`: fire-and-forget messages on named channels
//! - `request` / `respond`: correlated request-response on top of them
//! - timeouts: every request settles, either with a response or with
//!   `RequestError::Timeout`
//!
//! # Request lifecycle
//!
//! ```text
//! ISSUED    correlation id allocated, response waiter registered
//! AWAITING  request envelope sent, timer running
//! RESOLVED  matching response dispatched first: waiter removes itself, timer dropped
//! TIMED_OUT timer fired first: settles with Timeout, waiter removed
//! ```
//!
//! Both trigger paths feed one settle-once slot, so exactly one outcome is
//! delivered. There is no retry.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use duplex_protocol::{ChannelName, CorrelationCounter, CorrelationId, Envelope};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::runtime::Handle;

use super::registry::{self, Accept, ListenerKind, SharedRegistry, Subscription};
use super::settlement::{settlement, Settlement};
use crate::config::MessengerConfig;
use crate::error::{RequestError, ResponderError};
use crate::transport::{Dispatch, Transport};

type RequestOutcome = Result<Value, RequestError>;

struct Inner {
    transport: Box<dyn Transport>,
    registry: SharedRegistry,
    correlation: CorrelationCounter,
    config: MessengerConfig,
    /// Runtime the messenger was built on, if any. Responders spawn on it.
    runtime: Option<Handle>,
}

/// Typed messaging endpoint bound to one duplex transport.
///
/// Cheap to clone; all clones share the same listener registry and
/// correlation counter.
#[derive(Clone)]
pub struct Messenger {
    inner: Arc<Inner>,
}

impl Messenger {
    /// Bind a messenger to `transport`.
    ///
    /// Registers the messenger's dispatch callback with the transport exactly
    /// once. The callback only holds a weak reference, so a transport that
    /// outlives the messenger does not keep it alive.
    pub fn new(transport: impl Transport, config: MessengerConfig) -> Self {
        let inner = Arc::new(Inner {
            transport: Box::new(transport),
            registry: SharedRegistry::default(),
            correlation: CorrelationCounter::new(),
            config,
            runtime: Handle::try_current().ok(),
        });

        let weak = Arc::downgrade(&inner);
        let dispatch: Dispatch = Arc::new(move |raw: Value| {
            if let Some(inner) = weak.upgrade() {
                inner.dispatch(raw);
            }
        });
        inner.transport.add_listener(dispatch);

        Self { inner }
    }

    pub fn with_defaults(transport: impl Transport) -> Self {
        Self::new(transport, MessengerConfig::default())
    }

    pub fn config(&self) -> &MessengerConfig {
        &self.inner.config
    }

    /// Send a fire-and-forget message.
    ///
    /// Never fails: whether anyone on the other side listens is not observed.
    pub fn publish(&self, channel: impl Into<ChannelName>, payload: Value) {
        self.inner.send(Envelope::publish(channel, payload));
    }

    /// Listen to every message on `channel`.
    ///
    /// Listeners on one channel fire in registration order. The returned
    /// `Subscription` removes exactly this listener.
    pub fn subscribe<F>(&self, channel: impl Into<ChannelName>, listener: F) -> Subscription
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        self.inner
            .register(channel.into(), ListenerKind::Subscription, move |_this| {
                let accept: Accept =
                    Arc::new(move |payload: &Value, _id: Option<CorrelationId>| {
                        listener(payload.clone())
                    });
                accept
            })
    }

    /// Send a request and await the correlated response, using the configured
    /// default timeout.
    pub async fn request(
        &self,
        channel: impl Into<ChannelName>,
        payload: Value,
    ) -> Result<Value, RequestError> {
        let timeout = self.inner.config.default_timeout();
        self.request_with_timeout(channel, payload, timeout).await
    }

    /// Send a request and await the correlated response.
    ///
    /// Responses are matched by correlation id only, so any number of requests
    /// may be outstanding on one channel and answered in any order. If this
    /// future is dropped before it settles, the response waiter is removed.
    pub async fn request_with_timeout(
        &self,
        channel: impl Into<ChannelName>,
        payload: Value,
        timeout: Duration,
    ) -> Result<Value, RequestError> {
        let channel = channel.into();
        let correlation_id = self.inner.correlation.next_id();
        let (settlement, mut response_rx) = settlement::<RequestOutcome>();

        let _waiter = WaiterGuard(self.inner.register_waiter(
            channel.clone(),
            correlation_id,
            Arc::clone(&settlement),
        ));

        self.inner.send(Envelope::correlated(
            channel.clone(),
            payload,
            Some(correlation_id),
        ));

        tokio::select! {
            outcome = &mut response_rx => outcome.unwrap_or(Err(RequestError::Cancelled)),
            () = tokio::time::sleep(timeout) => {
                let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
                let timed_out = settlement.settle(Err(RequestError::Timeout {
                    channel: channel.clone(),
                    timeout_ms,
                }));
                if timed_out {
                    tracing::debug!(
                        channel = %channel,
                        correlation_id = %correlation_id,
                        timeout_ms = %timeout_ms,
                        "Request timed out - removing response waiter"
                    );
                }
                // Holds whichever outcome won, ours or a response that raced in.
                response_rx.await.unwrap_or(Err(RequestError::Cancelled))
            }
        }
    }

    /// Answer requests on `channel` with an async handler.
    ///
    /// The handler's future is spawned on the tokio runtime current at this call,
    /// or else the one the messenger was built on, so transports may dispatch
    /// from threads outside the runtime. Its `Ok` value is sent back with the
    /// request's correlation id. If the handler fails, no
    /// response is sent and the requester runs into its timeout.
    ///
    /// One responder per channel is the intended usage. Additional responders
    /// are allowed but each answers every request; the requester keeps only the
    /// first reply.
    pub fn respond<F, Fut, E>(&self, channel: impl Into<ChannelName>, handler: F) -> Subscription
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, E>> + Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        let channel = channel.into();
        let messenger = Arc::downgrade(&self.inner);
        let reply_channel = channel.clone();
        let runtime = Handle::try_current()
            .ok()
            .or_else(|| self.inner.runtime.clone());

        self.register_responder(channel, move |_this| {
            let accept: Accept =
                Arc::new(move |payload: &Value, correlation_id: Option<CorrelationId>| {
                    let Some(inner) = messenger.upgrade() else {
                        return;
                    };
                    let channel = reply_channel.clone();
                    let spawner = match runtime.clone().or_else(|| Handle::try_current().ok()) {
                        Some(handle) => handle,
                        None => {
                            tracing::warn!(
                                channel = %channel,
                                "No tokio runtime to run responder on - request dropped"
                            );
                            return;
                        }
                    };
                    let reply = handler(payload.clone());
                    spawner.spawn(async move {
                        match reply.await {
                            Ok(result) => {
                                inner.send(Envelope::correlated(channel, result, correlation_id))
                            }
                            Err(error) => log_responder_fault(&channel, correlation_id, &error),
                        }
                    });
                });
            accept
        })
    }

    /// Answer requests on `channel` with a handler that completes immediately.
    ///
    /// The reply is sent from within the dispatch of the request itself.
    pub fn respond_sync<F, E>(&self, channel: impl Into<ChannelName>, handler: F) -> Subscription
    where
        F: Fn(Value) -> Result<Value, E> + Send + Sync + 'static,
        E: fmt::Display,
    {
        let channel = channel.into();
        let messenger = Arc::downgrade(&self.inner);
        let reply_channel = channel.clone();

        self.register_responder(channel, move |_this| {
            let accept: Accept =
                Arc::new(move |payload: &Value, correlation_id: Option<CorrelationId>| {
                    let Some(inner) = messenger.upgrade() else {
                        return;
                    };
                    match handler(payload.clone()) {
                        Ok(result) => inner.send(Envelope::correlated(
                            reply_channel.clone(),
                            result,
                            correlation_id,
                        )),
                        Err(error) => log_responder_fault(&reply_channel, correlation_id, &error),
                    }
                });
            accept
        })
    }

    // =========================================================================
    // Typed helpers
    // =========================================================================

    /// `publish` with a serde-serializable payload.
    pub fn publish_typed<T>(
        &self,
        channel: impl Into<ChannelName>,
        payload: &T,
    ) -> Result<(), serde_json::Error>
    where
        T: Serialize + ?Sized,
    {
        let payload = serde_json::to_value(payload)?;
        self.publish(channel, payload);
        Ok(())
    }

    /// `subscribe` decoding each payload as `T`.
    ///
    /// Payloads that do not decode are skipped for this listener.
    pub fn subscribe_typed<T, F>(&self, channel: impl Into<ChannelName>, listener: F) -> Subscription
    where
        T: DeserializeOwned,
        F: Fn(T) + Send + Sync + 'static,
    {
        let channel = channel.into();
        let log_channel = channel.clone();
        self.subscribe(channel, move |payload| {
            match serde_json::from_value::<T>(payload) {
                Ok(message) => listener(message),
                Err(error) => tracing::debug!(
                    channel = %log_channel,
                    error = %error,
                    "Skipping payload that does not match the subscribed type"
                ),
            }
        })
    }

    /// `request` with serde-typed request and response payloads.
    pub async fn request_typed<Req, Resp>(
        &self,
        channel: impl Into<ChannelName>,
        payload: &Req,
    ) -> Result<Resp, RequestError>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let payload =
            serde_json::to_value(payload).map_err(|e| RequestError::Encode(e.to_string()))?;
        let response = self.request(channel, payload).await?;
        serde_json::from_value(response).map_err(|e| RequestError::Decode(e.to_string()))
    }

    /// `respond` with serde-typed request and response payloads.
    ///
    /// A request payload that does not decode as `Req` is treated like a
    /// handler failure: logged, unanswered.
    pub fn respond_typed<Req, Resp, F, Fut, E>(
        &self,
        channel: impl Into<ChannelName>,
        handler: F,
    ) -> Subscription
    where
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + Send + 'static,
        F: Fn(Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp, E>> + Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        let handler = Arc::new(handler);
        self.respond(channel, move |payload| {
            let handler = Arc::clone(&handler);
            async move {
                let request: Req = serde_json::from_value(payload)
                    .map_err(|e| ResponderError::Decode(e.to_string()))?;
                let response = handler(request)
                    .await
                    .map_err(|e| ResponderError::Handler(e.to_string()))?;
                let value = serde_json::to_value(response)
                    .map_err(|e| ResponderError::Encode(e.to_string()))?;
                Ok::<Value, ResponderError>(value)
            }
        })
    }

    // =========================================================================
    // Diagnostics
    // =========================================================================

    /// Number of listener entries of any kind on `channel`.
    pub fn listener_count(&self, channel: &str) -> usize {
        registry::lock(&self.inner.registry).count(channel)
    }

    /// Number of listener entries of `kind` on `channel`.
    pub fn listener_count_of(&self, channel: &str, kind: ListenerKind) -> usize {
        registry::lock(&self.inner.registry).count_of(channel, kind)
    }

    fn register_responder(
        &self,
        channel: ChannelName,
        build: impl FnOnce(Subscription) -> Accept,
    ) -> Subscription {
        let existing = self.listener_count_of(channel.as_str(), ListenerKind::Responder);
        if existing > 0 {
            tracing::warn!(
                channel = %channel,
                existing = existing,
                "Registering an additional responder - every responder will answer each request"
            );
        }
        self.inner.register(channel, ListenerKind::Responder, build)
    }
}

impl fmt::Debug for Messenger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Messenger")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl Inner {
    /// The one callback registered with the transport.
    fn dispatch(&self, raw: Value) {
        let envelope = match Envelope::decode(raw) {
            Ok(envelope) => envelope,
            Err(error) => {
                tracing::trace!(error = %error, "Discarding malformed inbound message");
                return;
            }
        };

        let listeners = registry::lock(&self.registry).snapshot(envelope.channel.as_str());
        if listeners.is_empty() {
            tracing::trace!(channel = %envelope.channel, "No listeners for inbound message");
            return;
        }
        for listener in &listeners {
            listener.accept(&envelope.payload, envelope.correlation_id);
        }
    }

    fn send(&self, envelope: Envelope) {
        tracing::trace!(
            channel = %envelope.channel,
            correlation_id = ?envelope.correlation_id.map(CorrelationId::get),
            "Sending envelope"
        );
        self.transport.send(envelope);
    }

    /// Register a listener whose callback is built knowing its own subscription.
    fn register(
        &self,
        channel: ChannelName,
        kind: ListenerKind,
        build: impl FnOnce(Subscription) -> Accept,
    ) -> Subscription {
        let mut registry = registry::lock(&self.registry);
        let id = registry.allocate_id();
        let subscription = Subscription::new(&self.registry, channel.clone(), id, kind);
        registry.insert(channel, id, kind, build(subscription.clone()));
        subscription
    }

    /// One-shot listener settling `settlement` with the response to `correlation_id`.
    fn register_waiter(
        &self,
        channel: ChannelName,
        correlation_id: CorrelationId,
        settlement: Arc<Settlement<RequestOutcome>>,
    ) -> Subscription {
        self.register(channel, ListenerKind::ResponseWaiter, move |this| {
            let accept: Accept =
                Arc::new(move |payload: &Value, incoming: Option<CorrelationId>| {
                    if incoming != Some(correlation_id) {
                        return;
                    }
                    settlement.settle(Ok(payload.clone()));
                    this.unsubscribe();
                });
            accept
        })
    }
}

/// Removes a request's response waiter however the request ends.
struct WaiterGuard(Subscription);

impl Drop for WaiterGuard {
    fn drop(&mut self) {
        self.0.unsubscribe();
    }
}

fn log_responder_fault(
    channel: &ChannelName,
    correlation_id: Option<CorrelationId>,
    error: &dyn fmt::Display,
) {
    tracing::warn!(
        channel = %channel,
        correlation_id = ?correlation_id.map(CorrelationId::get),
        error = %error,
        "Responder failed - no response sent, request will time out"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransport;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    /// Mock transport that records the dispatch callback it is handed.
    fn mock_with_dispatch() -> (MockTransport, Arc<Mutex<Option<Dispatch>>>) {
        let slot: Arc<Mutex<Option<Dispatch>>> = Arc::new(Mutex::new(None));
        let slot_clone = Arc::clone(&slot);
        let mut transport = MockTransport::new();
        transport
            .expect_add_listener()
            .times(1)
            .returning(move |dispatch| *slot_clone.lock().unwrap() = Some(dispatch));
        (transport, slot)
    }

    fn deliver(slot: &Mutex<Option<Dispatch>>, raw: Value) {
        let dispatch = slot.lock().unwrap().clone().unwrap();
        dispatch(raw);
    }

    #[test]
    fn test_registers_dispatch_exactly_once() {
        let (transport, slot) = mock_with_dispatch();
        let _messenger = Messenger::with_defaults(transport);
        assert!(slot.lock().unwrap().is_some());
    }

    #[test]
    fn test_publish_sends_uncorrelated_envelope() {
        let (mut transport, _slot) = mock_with_dispatch();
        transport
            .expect_send()
            .withf(|envelope| {
                envelope.channel.as_str() == "foo"
                    && envelope.payload == json!("bar")
                    && envelope.correlation_id.is_none()
            })
            .times(1)
            .return_const(());

        let messenger = Messenger::with_defaults(transport);
        messenger.publish("foo", json!("bar"));
    }

    #[tokio::test]
    async fn test_request_sends_correlated_envelope_then_times_out() {
        let (mut transport, _slot) = mock_with_dispatch();
        transport
            .expect_send()
            .withf(|envelope| {
                envelope.channel.as_str() == "foo"
                    && envelope.correlation_id == Some(CorrelationId::new(0))
            })
            .times(1)
            .return_const(());

        let messenger = Messenger::with_defaults(transport);
        let result = messenger
            .request_with_timeout("foo", json!(1), Duration::from_millis(10))
            .await;

        assert_eq!(
            result,
            Err(RequestError::Timeout {
                channel: ChannelName::from("foo"),
                timeout_ms: 10,
            })
        );
        assert_eq!(messenger.listener_count("foo"), 0);
    }

    #[tokio::test]
    async fn test_matching_dispatch_resolves_request() {
        let (mut transport, slot) = mock_with_dispatch();
        let slot_for_send = Arc::clone(&slot);
        // Answer every request with a response carrying a different payload.
        transport.expect_send().returning(move |envelope| {
            let response = Envelope::correlated(
                envelope.channel,
                json!({"answered": envelope.payload}),
                envelope.correlation_id,
            );
            deliver(&slot_for_send, response.to_value());
        });

        let messenger = Messenger::with_defaults(transport);
        let response = messenger.request("foo", json!(7)).await.unwrap();

        assert_eq!(response, json!({"answered": 7}));
        assert_eq!(
            messenger.listener_count_of("foo", ListenerKind::ResponseWaiter),
            0
        );
    }

    #[tokio::test]
    async fn test_non_matching_correlation_id_is_ignored() {
        let (mut transport, slot) = mock_with_dispatch();
        let slot_for_send = Arc::clone(&slot);
        transport.expect_send().returning(move |envelope| {
            let wrong_id = envelope.correlation_id.map(|id| CorrelationId::new(id.get() + 100));
            let response = Envelope::correlated(envelope.channel, json!("wrong"), wrong_id);
            deliver(&slot_for_send, response.to_value());
        });

        let messenger = Messenger::with_defaults(transport);
        let result = messenger
            .request_with_timeout("foo", json!(1), Duration::from_millis(20))
            .await;

        assert!(result.unwrap_err().is_timeout());
    }

    #[test]
    fn test_dispatch_invokes_listeners_in_registration_order() {
        let (transport, slot) = mock_with_dispatch();
        let messenger = Messenger::with_defaults(transport);
        let order = Arc::new(Mutex::new(Vec::new()));

        for n in 0..3 {
            let order = Arc::clone(&order);
            messenger.subscribe("foo", move |_payload| order.lock().unwrap().push(n));
        }
        deliver(&slot, json!({"channel": "foo", "payload": null}));

        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn test_dispatch_routes_by_channel() {
        let (transport, slot) = mock_with_dispatch();
        let messenger = Messenger::with_defaults(transport);
        let calls = Arc::new(AtomicU32::new(0));

        let calls_clone = Arc::clone(&calls);
        messenger.subscribe("foo", move |_payload| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
        });
        deliver(&slot, json!({"channel": "bar", "payload": 1}));
        deliver(&slot, json!({"channel": "foo", "payload": 1}));

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_respond_sync_echoes_correlation_id() {
        let (mut transport, slot) = mock_with_dispatch();
        transport
            .expect_send()
            .withf(|envelope| {
                envelope.payload == json!(42) && envelope.correlation_id == Some(CorrelationId::new(5))
            })
            .times(1)
            .return_const(());

        let messenger = Messenger::with_defaults(transport);
        messenger.respond_sync("answer", |_payload| Ok::<_, String>(json!(42)));
        deliver(
            &slot,
            json!({"channel": "answer", "payload": "question", "correlationId": 5}),
        );
    }

    #[test]
    fn test_failing_sync_responder_sends_nothing() {
        let (mut transport, slot) = mock_with_dispatch();
        transport.expect_send().times(0);

        let messenger = Messenger::with_defaults(transport);
        messenger.respond_sync("answer", |_payload| Err::<Value, _>("nope"));
        deliver(
            &slot,
            json!({"channel": "answer", "payload": 1, "correlationId": 0}),
        );
    }

    #[test]
    fn test_dispatch_after_messenger_dropped_is_harmless() {
        let (transport, slot) = mock_with_dispatch();
        let messenger = Messenger::with_defaults(transport);
        messenger.subscribe("foo", |_payload| panic!("messenger is gone"));
        drop(messenger);

        deliver(&slot, json!({"channel": "foo", "payload": 1}));
    }
}
