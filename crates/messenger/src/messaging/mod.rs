//! Messenger core.
//!
//! - `registry`: channel -> ordered listener entries, plus the `Subscription` disposer
//! - `settlement`: the settle-once slot a pending request's response and timer race for
//! - `messenger`: the `Messenger` handle tying them to a transport

mod messenger;
mod registry;
mod settlement;

pub use messenger::Messenger;
pub use registry::{ListenerKind, Subscription};
