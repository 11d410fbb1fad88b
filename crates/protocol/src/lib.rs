//! Duplex Protocol - Shared wire types for the duplex messenger
//!
//! This crate contains the vocabulary both ends of a duplex transport agree on:
//! - `ChannelName`: the key a message is routed by
//! - `CorrelationId` / `CorrelationCounter`: pairing requests with their responses
//! - `Envelope`: the container handed to and received from the transport
//!
//! # Design Principles
//!
//! 1. **Minimal dependencies** - Only serde, serde_json, and thiserror
//! 2. **No runtime** - Pure data types plus a single decode step
//! 3. **Lenient inbound, strict outbound** - Decoding accepts anything with a
//!    channel and a payload; encoding always produces the canonical shape

pub mod channel;
pub mod correlation;
pub mod envelope;

pub use channel::ChannelName;
pub use correlation::{CorrelationCounter, CorrelationId, MAX_CORRELATION_ID};
pub use envelope::{DecodeError, Envelope};
