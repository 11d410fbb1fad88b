//! Duplex Messenger - typed messaging over an arbitrary duplex transport
//!
//! Layers three capabilities on a transport that can only send one message and
//! deliver inbound ones to a single callback:
//! - fire-and-forget publish/subscribe over named channels
//! - correlated request/response on top of publish
//! - timeout-bound settlement of every outstanding request
//!
//! ```no_run
//! use duplex_messenger::{memory, Messenger, MessengerConfig};
//! use serde_json::json;
//!
//! # async fn demo() -> Result<(), duplex_messenger::RequestError> {
//! let (left, right) = memory::pair();
//! let client = Messenger::new(left, MessengerConfig::default());
//! let server = Messenger::new(right, MessengerConfig::default());
//!
//! server.respond_sync("echo", |payload| Ok::<_, std::convert::Infallible>(payload));
//! let reply = client.request("echo", json!("hello")).await?;
//! assert_eq!(reply, json!("hello"));
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod messaging;
pub mod transport;

pub use config::{MessengerConfig, DEFAULT_TIMEOUT_MS, TIMEOUT_ENV_VAR};
pub use error::{ConfigError, RequestError, ResponderError};
pub use messaging::{ListenerKind, Messenger, Subscription};
pub use transport::{memory, Dispatch, FnTransport, Transport};

pub use duplex_protocol::{ChannelName, CorrelationId, DecodeError, Envelope};
