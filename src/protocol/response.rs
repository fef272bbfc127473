use super::{EnvelopeError, Payload, ResponseEnvelope};
use crate::error::{RemoteError, RpcError};

/// Unwraps the outcome of a response envelope
///
/// An `err` field takes precedence and is turned into [`RpcError::Remote`] carrying the payload
/// verbatim. Otherwise the `response` field is returned. Envelopes containing neither are
/// rejected as malformed.
pub fn parse_response(envelope: ResponseEnvelope) -> Result<Payload, RpcError> {
    match envelope {
        ResponseEnvelope { err: Some(err), .. } => Err(RemoteError::new(err).into()),
        ResponseEnvelope {
            response: Some(response),
            ..
        } => Ok(response),
        _ => Err(EnvelopeError::MissingOutcome.into()),
    }
}
