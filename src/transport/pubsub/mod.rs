//! Request/response on top of publish/subscribe channels
//!
//! Requests are published on the channel named after their pattern. Peers publish their replies
//! on `<pattern>.reply`, a channel shared by every client talking to the same pattern. Thus,
//! each reply is broadcast to all listeners and the [`CorrelationRegistry`] decides which
//! pending request (if any) it belongs to. Replies for foreign ids are silently dropped.
//!
//! Network functionality is delegated to implementations of the [`PubSubFactory`] and
//! [`PubSubConnection`] traits, the [`redis`] module provides the default one.

use super::{ConnectionState, Transport, DEFAULT_RESPONSE_TIMEOUT};
use crate::error::{BoxedError, EmptyResult, RpcError};
use crate::protocol::{
    decode_response, encode_request, parse_response, CorrelationId, CorrelationRegistry, Payload,
};
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, trace, warn};

#[cfg(feature = "redis")]
pub mod redis;

#[cfg(test)]
mod memory;

const REPLY_CHANNEL_SUFFIX: &str = ".reply";

/// Raw messages received on a subscribed channel
pub type MessageStream = BoxStream<'static, Result<Vec<u8>, BoxedError>>;

/// Channel on which replies to requests for the given pattern are published
pub fn reply_channel(pattern: &str) -> String {
    format!("{}{}", pattern, REPLY_CHANNEL_SUFFIX)
}

/// Established connection to a publish/subscribe broker
#[async_trait]
pub trait PubSubConnection {
    /// Publishes an opaque payload on a channel
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> EmptyResult;

    /// Subscribes to a channel
    ///
    /// Must only return once the broker has confirmed the subscription so that no message
    /// published afterwards can be missed. Dropping the returned stream ends the subscription.
    async fn subscribe(&self, channel: &str) -> Result<MessageStream, BoxedError>;

    /// Releases the connection
    async fn close(&self) -> EmptyResult;
}

/// Factory for [`PubSubConnection`] instances
#[async_trait]
pub trait PubSubFactory {
    /// Type of connection created by this factory
    type Connection: PubSubConnection + Send + Sync;

    /// Establishes a new connection to the broker
    async fn connect(&self) -> Result<Self::Connection, BoxedError>;
}

/// [`Transport`] implementation using publish/subscribe channels
pub struct PubSubTransport<F: PubSubFactory> {
    factory: F,
    response_timeout: Duration,
    state: Mutex<ConnectionState<Arc<F::Connection>>>,
    registry: Arc<CorrelationRegistry>,
}

impl<F> PubSubTransport<F>
where
    F: PubSubFactory,
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

/// Decodes every message on a reply channel and hands it to the registry
///
/// Returns once the subscription ends, which only happens when the connection went away.
async fn dispatch_replies(mut replies: MessageStream, registry: &CorrelationRegistry) {
    while let Some(message) = replies.next().await {
        let bytes = match message {
            Ok(bytes) => bytes,
            Err(error) => {
                warn!(%error, "Reply subscription failed");
                break;
            }
        };

        match decode_response(&bytes) {
            Ok(envelope) => match envelope.id.clone() {
                Some(id) => {
                    registry.resolve(&id, Ok(envelope));
                }
                None => warn!("Dropping reply without correlation id"),
            },
            // There is no way to tell whom a broken message on a shared channel was meant for
            Err(error) => warn!(?error, "Dropping malformed reply"),
        }
    }

    trace!("Reply subscription ended");
}

#[async_trait]
impl<F> Transport for PubSubTransport<F>
where
    F: PubSubFactory + Send + Sync,
{
    async fn connect(&self) -> Result<(), RpcError> {
        let mut state = self.state.lock().await;

        if state.needs_connection()? {
            let connection = self.factory.connect().await.map_err(RpcError::Transport)?;
            *state = ConnectionState::Connected(Arc::new(connection));
            info!("Connected to publish/subscribe broker");
        }

        Ok(())
    }

    async fn close(&self) -> Result<(), RpcError> {
        let connection = self.state.lock().await.close();
        self.registry.resolve_all();

        if let Some(connection) = connection {
            connection.close().await.map_err(RpcError::Transport)?;
            info!("Closed publish/subscribe connection");
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

        // The subscription has to be active before publishing, fast peers would reply into the void otherwise
        let channel = reply_channel(pattern);
        let replies = connection
            .subscribe(&channel)
            .await
            .map_err(RpcError::Transport)?;
        trace!(%channel, "Subscribed to reply channel");

        connection
            .publish(pattern, body)
            .await
            .map_err(RpcError::Transport)?;
        debug!("Published request");

        let waiter = pending.wait(self.response_timeout);
        tokio::pin!(waiter);

        // Leaving this block drops the subscription, regardless of the outcome
        let outcome = tokio::select! {
            outcome = &mut waiter => outcome,
            _ = dispatch_replies(replies, &self.registry) => {
                self.registry.resolve(&id, Err(RpcError::ConnectionLost));
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
