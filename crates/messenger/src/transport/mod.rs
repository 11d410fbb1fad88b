//! The duplex transport the messenger is bound to.
//!
//! The transport is an external collaborator. Its delivery ordering, reliability
//! and reconnection behavior are assumed, not implemented here. The messenger
//! only needs two capabilities from it:
//! - `send`: hand one envelope to the peer
//! - `add_listener`: register the single inbound dispatch callback
//!
//! `FnTransport` adapts a pair of closures; `memory::pair` gives two connected
//! in-process endpoints for tests and demos.

pub mod memory;

use std::fmt;
use std::sync::Arc;

use duplex_protocol::Envelope;
use serde_json::Value;

/// Inbound dispatch callback, invoked once per raw message the transport receives.
pub type Dispatch = Arc<dyn Fn(Value) + Send + Sync + 'static>;

/// Port for the transport a messenger is bound to.
#[cfg_attr(test, mockall::automock)]
pub trait Transport: Send + Sync + 'static {
    /// Hand one envelope to the peer. Synchronous from the messenger's point of view.
    fn send(&self, envelope: Envelope);

    /// Register the inbound dispatch callback. Called exactly once, at construction.
    fn add_listener(&self, dispatch: Dispatch);
}

/// Transport built from two closures.
pub struct FnTransport<S, L> {
    send: S,
    add_listener: L,
}

impl<S, L> FnTransport<S, L>
where
    S: Fn(Envelope) + Send + Sync + 'static,
    L: Fn(Dispatch) + Send + Sync + 'static,
{
    pub fn new(send: S, add_listener: L) -> Self {
        Self { send, add_listener }
    }
}

impl<S, L> Transport for FnTransport<S, L>
where
    S: Fn(Envelope) + Send + Sync + 'static,
    L: Fn(Dispatch) + Send + Sync + 'static,
{
    fn send(&self, envelope: Envelope) {
        (self.send)(envelope)
    }

    fn add_listener(&self, dispatch: Dispatch) {
        (self.add_listener)(dispatch)
    }
}

impl<S, L> fmt::Debug for FnTransport<S, L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnTransport").finish_non_exhaustive()
    }
}

impl<T: Transport + ?Sized> Transport for Arc<T> {
    fn send(&self, envelope: Envelope) {
        (**self).send(envelope)
    }

    fn add_listener(&self, dispatch: Dispatch) {
        (**self).add_listener(dispatch)
    }
}
