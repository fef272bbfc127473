use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::error::Error;
use std::fmt::{self, Display, Formatter};
use thiserror::Error;

use crate::protocol::{CorrelationId, EnvelopeError};

/// Generic error type
pub type BoxedError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result with no value and a [`BoxedError`]
pub type EmptyResult = Result<(), BoxedError>;

/// Failure surfaced by any [`Transport`](crate::transport::Transport) operation
///
/// None of these are retried by the transports themselves, retry policies belong to the caller.
#[derive(Error, Debug)]
pub enum RpcError {
    /// Operation attempted while the transport was not connected
    #[error("transport is not connected")]
    NotConnected,
    /// Connection attempted on a transport that has already been closed
    #[error("transport has been closed")]
    Closed,
    /// No reply arrived within the configured response timeout
    #[error("timed out waiting for a response")]
    Timeout,
    /// Underlying connection dropped while the request was pending
    #[error("connection lost while awaiting a response")]
    ConnectionLost,
    /// Received data could not be decoded into a response envelope
    #[error("received malformed envelope")]
    MalformedEnvelope(#[from] EnvelopeError),
    /// Peer explicitly answered with an error
    #[error("remote responded with an error: {0}")]
    Remote(#[from] RemoteError),
    /// A reply on a private reply channel carried an unexpected correlation id
    #[error("reply correlation id {received:?} does not match request {expected}")]
    CorrelationMismatch {
        /// Id of the request that is waiting for a reply
        expected: CorrelationId,
        /// Id carried by the reply, if any
        received: Option<String>,
    },
    /// Typed request or response could not be converted from or to a payload
    #[error("payload could not be converted")]
    InvalidPayload(#[source] serde_json::Error),
    /// Substrate specific I/O failure
    #[error("transport failure")]
    Transport(#[source] BoxedError),
}

impl RpcError {
    /// Wraps any substrate error into [`RpcError::Transport`]
    pub fn transport<E>(e: E) -> Self
    where
        E: Into<BoxedError>,
    {
        Self::Transport(e.into())
    }

    /// Classifies a socket error, treating a peer that went away as [`RpcError::ConnectionLost`]
    pub fn io(error: std::io::Error) -> Self {
        use std::io::ErrorKind;

        match error.kind() {
            ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof
            | ErrorKind::NotConnected => Self::ConnectionLost,
            _ => Self::Transport(error.into()),
        }
    }
}

/// Error payload returned by a remote peer in the `err` field of a response
///
/// The payload is retained verbatim as the core has no knowledge about its shape. NestJS
/// peers conventionally send an object with `message` and optionally `code` or `status` fields
/// which can be accessed through the helper methods.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(transparent)]
pub struct RemoteError {
    payload: Value,
}

impl RemoteError {
    /// Creates a new instance from the raw error payload
    pub fn new(payload: Value) -> Self {
        Self { payload }
    }

    /// Raw error payload as sent by the peer
    pub fn payload(&self) -> &Value {
        &self.payload
    }

    /// Consumes the error and returns the raw payload
    pub fn into_payload(self) -> Value {
        self.payload
    }

    /// Value of the `code` field (falling back to `status`) if the payload is an object
    pub fn code(&self) -> Option<&Value> {
        self.payload
            .get("code")
            .or_else(|| self.payload.get("status"))
    }

    /// Value of the `message` field, or the payload itself if it is a plain string
    pub fn message(&self) -> Option<&str> {
        match &self.payload {
            Value::String(message) => Some(message),
            payload => payload.get("message").and_then(Value::as_str),
        }
    }
}

impl Error for RemoteError {}

impl Display for RemoteError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match (self.message(), self.code()) {
            (Some(message), Some(code)) => write!(f, "{} ({})", message, code),
            (Some(message), None) => write!(f, "{}", message),
            _ => write!(f, "{}", self.payload),
        }
    }
}
