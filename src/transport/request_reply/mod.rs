//! Request/response on top of a broker with native request/reply support
//!
//! Brokers like NATS route a reply straight back to its requester through a private inbox
//! subject, so there is no shared reply channel to listen on. The correlation id is still
//! attached to every request and validated against the envelope of the reply, a reply carrying a
//! different id is reported as [`RpcError::CorrelationMismatch`].
//!
//! Pending requests are tracked by the [`CorrelationRegistry`] so that closing the transport
//! fails them with [`RpcError::ConnectionLost`] and the response timeout applies uniformly.
//!
//! Network functionality is delegated to implementations of the [`RequestReplyFactory`] and
//! [`RequestReplyConnection`] traits, the [`nats`] module provides the default one.

use super::{ConnectionState, Transport, DEFAULT_RESPONSE_TIMEOUT};
use crate::error::{BoxedError, EmptyResult, RpcError};
use crate::protocol::{
    decode_response, encode_request, parse_response, CorrelationId, CorrelationRegistry, Payload,
    ReplyOutcome,
};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};

#[cfg(feature = "nats")]
pub mod nats;

#[cfg(test)]
mod memory;

/// Established connection to a broker offering request/reply
#[async_trait]
pub trait RequestReplyConnection {
    /// Publishes a request on the subject and resolves with the payload of the first reply
    ///
    /// Implementations must not time out on their own, the transport drops the returned future
    /// once it stops waiting.
    async fn request(&self, subject: &str, payload: Vec<u8>) -> Result<Vec<u8>, BoxedError>;

    /// Publishes a message without expecting a reply
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> EmptyResult;

    /// Flushes outstanding messages and releases the connection
    async fn close(&self) -> EmptyResult;
}

/// Factory for [`RequestReplyConnection`] instances
#[async_trait]
pub trait RequestReplyFactory {
    /// Type of connection created by this factory
    type Connection: RequestReplyConnection + Send + Sync;

    /// Establishes a new connection to the broker
    async fn connect(&self) -> Result<Self::Connection, BoxedError>;
}

/// [`Transport`] implementation using native request/reply of a broker
pub struct RequestReplyTransport<F: RequestReplyFactory> {
    factory: F,
    response_timeout: Duration,
    state: Mutex<ConnectionState<Arc<F::Connection>>>,
    registry: Arc<CorrelationRegistry>,
}

impl<F> RequestReplyTransport<F>
where
    F: RequestReplyFactory,
{
    /// Creates a new, disconnected transport using the default response timeout
    pub fn new(factory: F) -> Self {
        Self::with_timeout(factory, DEFAULT_RESPONSE_TIMEOUT)
    }

    /// Creates a new, disconnected transport waiting at most `response_timeout` for replies
    pub fn with_timeout(factory: F, response_timeout: Duration) -> Self {
        Self {
            factory,
            response_timeout,
            state: Mutex::new(ConnectionState::Disconnected),
            registry: CorrelationRegistry::new(),
        }
    }

    /// Number of requests currently awaiting a reply
    pub fn pending_requests(&self) -> usize {
        self.registry.len()
    }

    async fn connection(&self) -> Result<Arc<F::Connection>, RpcError> {
        self.state.lock().await.connection().map(Arc::clone)
    }
}

fn check_reply(reply: Result<Vec<u8>, BoxedError>, expected: &CorrelationId) -> ReplyOutcome {
    let envelope = decode_response(&reply.map_err(RpcError::Transport)?)?;

    match &envelope.id {
        Some(received) if received != expected => Err(RpcError::CorrelationMismatch {
            expected: expected.clone(),
            received: Some(received.to_string()),
        }),
        _ => Ok(envelope),
    }
}

#[async_trait]
impl<F> Transport for RequestReplyTransport<F>
where
    F: RequestReplyFactory + Send + Sync,
{
    async fn connect(&self) -> Result<(), RpcError> {
        let mut state = self.state.lock().await;

        if state.needs_connection()? {
            let connection = self.factory.connect().await.map_err(RpcError::Transport)?;
            *state = ConnectionState::Connected(Arc::new(connection));
            info!("Connected to request/reply broker");
        }

        Ok(())
    }

    async fn close(&self) -> Result<(), RpcError> {
        let connection = self.state.lock().await.close();
        self.registry.resolve_all();

        if let Some(connection) = connection {
            connection.close().await.map_err(RpcError::Transport)?;
            info!("Closed request/reply connection");
        }

        Ok(())
    }

    #[instrument(skip(self, data), fields(id))]
    async fn send(&self, pattern: &str, data: Payload) -> Result<Payload, RpcError> {
        let connection = self.connection().await?;
        let id = CorrelationId::new();
        tracing::Span::current().record("id", &id.as_str());

        let body = encode_request(Some(&id), pattern, &data).map_err(RpcError::InvalidPayload)?;
        let pending = self.registry.register(id.clone());

        let waiter = pending.wait(self.response_timeout);
        tokio::pin!(waiter);

        // Leaving this block drops the broker request, regardless of the outcome
        let outcome = tokio::select! {
            outcome = &mut waiter => outcome,
            reply = connection.request(pattern, body) => {
                debug!("Received reply");
                self.registry.resolve(&id, check_reply(reply, &id));
                waiter.await
            }
        };

        parse_response(outcome?)
    }

    #[instrument(skip(self, data))]
    async fn emit(&self, pattern: &str, data: Payload) -> Result<(), RpcError> {
        let connection = self.connection().await?;
        let body = encode_request(None, pattern, &data).map_err(RpcError::InvalidPayload)?;

        connection
            .publish(pattern, body)
            .await
            .map_err(RpcError::Transport)?;
        debug!("Published event");

        Ok(())
    }
}
