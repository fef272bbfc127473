use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt::{self, Display, Formatter};
use thiserror::Error;
use uuid::Uuid;

/// Arbitrary structured value carried in requests and responses
pub type Payload = Value;

const FIELD_ID: &str = "id";
const FIELD_RESPONSE: &str = "response";
const FIELD_ERR: &str = "err";

/// Unique token linking a request to its eventual reply
///
/// Freshly minted identifiers are random version 4 UUIDs rendered in their hyphenated form.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Mints a new, globally unique identifier
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_hyphenated().to_string())
    }

    /// String representation as it appears on the wire
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for CorrelationId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for CorrelationId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for CorrelationId {
    fn from(id: &str) -> Self {
        Self(id.to_owned())
    }
}

impl PartialEq<str> for CorrelationId {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

/// Reasons for rejecting received data as a response envelope
#[derive(Error, Debug)]
pub enum EnvelopeError {
    /// Data is not valid JSON
    #[error("envelope is not valid JSON")]
    InvalidJson(#[from] serde_json::Error),
    /// Data is valid JSON but not an object
    #[error("envelope is not a JSON object")]
    NotAnObject,
    /// The `id` field is present but not a string
    #[error("envelope id is not a string")]
    InvalidId,
    /// Neither a `response` nor an `err` field is present
    #[error("envelope contains neither a response nor an error")]
    MissingOutcome,
    /// Outer framing of a byte stream could not be parsed
    #[error("invalid frame: {0}")]
    InvalidFrame(String),
}

/// Outgoing request as it is serialized onto the wire
#[derive(Serialize, Debug)]
pub struct RequestEnvelope<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<&'a CorrelationId>,
    pattern: &'a str,
    data: &'a Payload,
}

impl<'a> RequestEnvelope<'a> {
    /// Envelope for a request expecting a reply
    pub fn request(id: &'a CorrelationId, pattern: &'a str, data: &'a Payload) -> Self {
        Self {
            id: Some(id),
            pattern,
            data,
        }
    }

    /// Envelope for a fire-and-forget event
    pub fn event(pattern: &'a str, data: &'a Payload) -> Self {
        Self {
            id: None,
            pattern,
            data,
        }
    }

    /// Serializes the envelope into compact JSON
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

/// Encodes a request envelope, omitting the `id` when none is given
pub fn encode_request(
    id: Option<&CorrelationId>,
    pattern: &str,
    data: &Payload,
) -> Result<Vec<u8>, serde_json::Error> {
    match id {
        Some(id) => RequestEnvelope::request(id, pattern, data),
        None => RequestEnvelope::event(pattern, data),
    }
    .encode()
}

/// Decoded reply as received from a peer
///
/// Presence of the `response` field is retained separately from its value so that a legitimate
/// `null` response can be told apart from a missing one. An `err` field containing `null` is
/// treated as absent.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseEnvelope {
    /// Correlation id of the request this reply belongs to, if the substrate includes it
    pub id: Option<CorrelationId>,
    /// Success payload
    pub response: Option<Payload>,
    /// Error payload
    pub err: Option<Payload>,
}

impl ResponseEnvelope {
    /// Successful reply to the given request
    pub fn success(id: Option<CorrelationId>, response: Payload) -> Self {
        Self {
            id,
            response: Some(response),
            err: None,
        }
    }

    /// Failed reply to the given request
    pub fn failure(id: Option<CorrelationId>, err: Payload) -> Self {
        Self {
            id,
            response: None,
            err: Some(err),
        }
    }
}

/// Decodes a response envelope, rejecting anything that is not a JSON object
pub fn decode_response(bytes: &[u8]) -> Result<ResponseEnvelope, EnvelopeError> {
    let mut object = match serde_json::from_slice::<Value>(bytes)? {
        Value::Object(object) => object,
        _ => return Err(EnvelopeError::NotAnObject),
    };

    let id = match object.remove(FIELD_ID) {
        None | Some(Value::Null) => None,
        Some(Value::String(id)) => Some(CorrelationId(id)),
        Some(_) => return Err(EnvelopeError::InvalidId),
    };

    Ok(ResponseEnvelope {
        id,
        response: object.remove(FIELD_RESPONSE),
        err: take_non_null(&mut object, FIELD_ERR),
    })
}

fn take_non_null(object: &mut Map<String, Value>, key: &str) -> Option<Value> {
    match object.remove(key) {
        Some(Value::Null) | None => None,
        value => value,
    }
}
