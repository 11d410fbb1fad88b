//! The envelope exchanged with the duplex transport.
//!
//! Outbound envelopes are built by the messenger and always have the canonical
//! shape. Inbound values are whatever the transport delivered; `Envelope::decode`
//! is the one place they are checked before anything reaches dispatch.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::channel::ChannelName;
use crate::correlation::CorrelationId;

const CHANNEL_FIELD: &str = "channel";
const PAYLOAD_FIELD: &str = "payload";
const CORRELATION_FIELD: &str = "correlationId";
/// Older peers name the correlation field `requestId`.
const LEGACY_CORRELATION_FIELD: &str = "requestId";

/// Wire-level container: channel, opaque payload, optional correlation id.
///
/// The correlation id is present on requests and on the responses that answer
/// them, and absent on plain publishes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub channel: ChannelName,
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<CorrelationId>,
}

/// Why an inbound value was not an envelope.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("inbound message is not an object")]
    NotAnObject,

    #[error("inbound message has no channel field")]
    MissingChannel,

    #[error("inbound message channel is not a string, number or boolean")]
    InvalidChannel,

    #[error("inbound message has no payload field")]
    MissingPayload,
}

impl Envelope {
    /// Envelope for a fire-and-forget publish.
    pub fn publish(channel: impl Into<ChannelName>, payload: Value) -> Self {
        Self {
            channel: channel.into(),
            payload,
            correlation_id: None,
        }
    }

    /// Envelope for a request (or a response echoing `correlation_id`).
    pub fn correlated(
        channel: impl Into<ChannelName>,
        payload: Value,
        correlation_id: Option<CorrelationId>,
    ) -> Self {
        Self {
            channel: channel.into(),
            payload,
            correlation_id,
        }
    }

    /// Validate a raw inbound value.
    ///
    /// Requires an object with a `channel` and a `payload` (JSON `null` counts
    /// as present). Numeric and boolean channels are keyed by their JSON text,
    /// so `5` routes to channel `"5"`; `null`, arrays and objects are rejected. The correlation id is optional and lenient: a missing
    /// or non-integer id decodes to `None` rather than failing.
    pub fn decode(raw: Value) -> Result<Self, DecodeError> {
        let Value::Object(mut fields) = raw else {
            return Err(DecodeError::NotAnObject);
        };

        let channel = match fields.remove(CHANNEL_FIELD) {
            Some(Value::String(name)) => ChannelName::from(name),
            Some(key @ (Value::Number(_) | Value::Bool(_))) => {
                ChannelName::from(key.to_string())
            }
            Some(_) => return Err(DecodeError::InvalidChannel),
            None => return Err(DecodeError::MissingChannel),
        };
        let payload = fields
            .remove(PAYLOAD_FIELD)
            .ok_or(DecodeError::MissingPayload)?;
        let correlation_id = fields
            .get(CORRELATION_FIELD)
            .or_else(|| fields.get(LEGACY_CORRELATION_FIELD))
            .and_then(CorrelationId::from_json);

        Ok(Self {
            channel,
            payload,
            correlation_id,
        })
    }

    /// Canonical JSON form, as handed to text-based transports.
    pub fn to_value(&self) -> Value {
        let mut fields = Map::with_capacity(3);
        fields.insert(
            CHANNEL_FIELD.to_owned(),
            Value::String(self.channel.as_str().to_owned()),
        );
        fields.insert(PAYLOAD_FIELD.to_owned(), self.payload.clone());
        if let Some(id) = self.correlation_id {
            fields.insert(CORRELATION_FIELD.to_owned(), Value::from(id.get()));
        }
        Value::Object(fields)
    }
}

impl TryFrom<Value> for Envelope {
    type Error = DecodeError;

    fn try_from(raw: Value) -> Result<Self, Self::Error> {
        Self::decode(raw)
    }
}

impl From<Envelope> for Value {
    fn from(envelope: Envelope) -> Self {
        envelope.to_value()
    }
}
