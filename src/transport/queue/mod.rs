//! Request/response on top of a queue broker with reply addresses
//!
//! Every request declares its own exclusive reply queue and starts consuming from it before the
//! request is published to the configured queue. The request carries both the correlation id
//! and the name of the reply queue as message properties, so the peer knows where to answer.
//! As the reply queue is private, any message arriving on it must belong to the request; a
//! differing correlation id indicates a protocol violation and is reported as
//! [`RpcError::CorrelationMismatch`].
//!
//! Network functionality is delegated to implementations of the [`QueueFactory`] and
//! [`QueueChannel`] traits, the [`amqp`] module provides the default one.

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

#[cfg(feature = "rabbitmq")]
pub mod amqp;

#[cfg(test)]
mod memory;

/// Message received from a queue
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    /// Correlation id message property
    pub correlation_id: Option<String>,
    /// Opaque message body
    pub body: Vec<u8>,
}

/// Properties attached to a published message
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageProperties {
    /// Correlation id of the request
    pub correlation_id: Option<String>,
    /// Name of the queue replies should be sent to
    pub reply_to: Option<String>,
}

/// Private queue which is being consumed from
pub struct ReplyQueue {
    /// Broker assigned name of the queue
    pub name: String,
    /// Messages arriving on the queue
    pub deliveries: BoxStream<'static, Result<Delivery, BoxedError>>,
}

/// Established channel to a queue broker
#[async_trait]
pub trait QueueChannel {
    /// Declares an exclusive, server-named queue and starts consuming from it
    ///
    /// Must only return once the consumer is active.
    async fn declare_reply_queue(&self) -> Result<ReplyQueue, BoxedError>;

    /// Publishes a message to the queue with the given name
    async fn publish(
        &self,
        queue: &str,
        body: Vec<u8>,
        properties: MessageProperties,
    ) -> EmptyResult;

    /// Removes a previously declared reply queue
    async fn delete_queue(&self, name: &str) -> EmptyResult;

    /// Releases the channel and its connection
    async fn close(&self) -> EmptyResult;
}

/// Factory for [`QueueChannel`] instances
#[async_trait]
pub trait QueueFactory {
    /// Type of channel created by this factory
    type Channel: QueueChannel + Send + Sync + 'static;

    /// Establishes a new connection to the broker and opens a channel on it
    async fn connect(&self) -> Result<Self::Channel, BoxedError>;
}

/// [`Transport`] implementation using a queue broker with per-request reply queues
pub struct QueueTransport<F: QueueFactory> {
    factory: F,
    queue: String,
    response_timeout: Duration,
    state: Mutex<ConnectionState<Arc<F::Channel>>>,
    registry: Arc<CorrelationRegistry>,
}

impl<F> QueueTransport<F>
where
    F: QueueFactory,
{
    /// Creates a new, disconnected transport publishing to the given queue
    pub fn new(factory: F, queue: impl Into<String>) -> Self {
        Self::with_timeout(factory, queue, DEFAULT_RESPONSE_TIMEOUT)
    }

    /// Creates a new, disconnected transport waiting at most `response_timeout` for replies
    pub fn with_timeout(factory: F, queue: impl Into<String>, response_timeout: Duration) -> Self {
        Self {
            factory,
            queue: queue.into(),
            response_timeout,
            state: Mutex::new(ConnectionState::Disconnected),
            registry: CorrelationRegistry::new(),
        }
    }

    /// Number of requests currently awaiting a reply
    pub fn pending_requests(&self) -> usize {
        self.registry.len()
    }

    async fn channel(&self) -> Result<Arc<F::Channel>, RpcError> {
        self.state.lock().await.connection().map(Arc::clone)
    }

    async fn request(
        &self,
        channel: &F::Channel,
        reply_queue: ReplyQueue,
        id: &CorrelationId,
        body: Vec<u8>,
    ) -> Result<Payload, RpcError> {
        let pending = self.registry.register(id.clone());

        let properties = MessageProperties {
            correlation_id: Some(id.to_string()),
            reply_to: Some(reply_queue.name.clone()),
        };

        channel
            .publish(&self.queue, body, properties)
            .await
            .map_err(RpcError::Transport)?;
        debug!(queue = %self.queue, "Published request");

        let waiter = pending.wait(self.response_timeout);
        tokio::pin!(waiter);

        let outcome = tokio::select! {
            outcome = &mut waiter => outcome,
            _ = dispatch_replies(reply_queue.deliveries, &self.registry, id) => {
                self.registry.resolve(id, Err(RpcError::ConnectionLost));
                waiter.await
            }
        };

        parse_response(outcome?)
    }
}

/// Deletes a reply queue once the request using it is done with it
///
/// Dropping the lease without releasing it, e.g. because the request future has been cancelled,
/// deletes the queue in the background.
struct ReplyQueueLease<C>
where
    C: QueueChannel + Send + Sync + 'static,
{
    channel: Arc<C>,
    name: Option<String>,
}

impl<C> ReplyQueueLease<C>
where
    C: QueueChannel + Send + Sync + 'static,
{
    async fn release(mut self) {
        if let Some(name) = self.name.take() {
            delete_reply_queue(self.channel.as_ref(), &name).await;
        }
    }
}

impl<C> Drop for ReplyQueueLease<C>
where
    C: QueueChannel + Send + Sync + 'static,
{
    fn drop(&mut self) {
        if let Some(name) = self.name.take() {
            let channel = self.channel.clone();

            match tokio::runtime::Handle::try_current() {
                Ok(runtime) => {
                    runtime.spawn(async move { delete_reply_queue(channel.as_ref(), &name).await });
                }
                Err(_) => warn!(reply_queue = %name, "Unable to delete abandoned reply queue"),
            }
        }
    }
}

async fn delete_reply_queue<C>(channel: &C, name: &str)
where
    C: QueueChannel + Send + Sync,
{
    // Exclusive queues vanish with the connection anyway, this only keeps long-lived connections tidy
    match channel.delete_queue(name).await {
        Ok(()) => trace!(reply_queue = name, "Deleted reply queue"),
        Err(error) => warn!(%error, reply_queue = name, "Unable to delete reply queue"),
    }
}

/// Matches deliveries on a private reply queue against the one request waiting on it
async fn dispatch_replies(
    mut deliveries: BoxStream<'static, Result<Delivery, BoxedError>>,
    registry: &CorrelationRegistry,
    expected: &CorrelationId,
) {
    while let Some(delivery) = deliveries.next().await {
        let delivery = match delivery {
            Ok(delivery) => delivery,
            Err(error) => {
                warn!(%error, "Reply consumer failed");
                break;
            }
        };

        let outcome = decode_response(&delivery.body)
            .map_err(RpcError::from)
            .and_then(|envelope| {
                // Peers may answer with the message property, the envelope id, or both
                let received = delivery
                    .correlation_id
                    .clone()
                    .or_else(|| envelope.id.as_ref().map(ToString::to_string));

                match received {
                    Some(received) if expected != received.as_str() => {
                        Err(RpcError::CorrelationMismatch {
                            expected: expected.clone(),
                            received: Some(received),
                        })
                    }
                    _ => Ok(envelope),
                }
            });

        if let Err(error) = &outcome {
            warn!(%error, "Received invalid reply on private reply queue");
        }

        registry.resolve(expected, outcome);
    }

    trace!("Reply consumer ended");
}

#[async_trait]
impl<F> Transport for QueueTransport<F>
where
    F: QueueFactory + Send + Sync,
{
    async fn connect(&self) -> Result<(), RpcError> {
        let mut state = self.state.lock().await;

        if state.needs_connection()? {
            let channel = self.factory.connect().await.map_err(RpcError::Transport)?;
            *state = ConnectionState::Connected(Arc::new(channel));
            info!(queue = %self.queue, "Connected to queue broker");
        }

        Ok(())
    }

    async fn close(&self) -> Result<(), RpcError> {
        let channel = self.state.lock().await.close();
        self.registry.resolve_all();

        if let Some(channel) = channel {
            channel.close().await.map_err(RpcError::Transport)?;
            info!("Closed queue broker connection");
        }

        Ok(())
    }

    #[instrument(skip(self, data), fields(id))]
    async fn send(&self, pattern: &str, data: Payload) -> Result<Payload, RpcError> {
        let channel = self.channel().await?;
        let id = CorrelationId::new();
        tracing::Span::current().record("id", &id.as_str());

        let body = encode_request(Some(&id), pattern, &data).map_err(RpcError::InvalidPayload)?;

        let reply_queue = channel
            .declare_reply_queue()
            .await
            .map_err(RpcError::Transport)?;
        trace!(reply_queue = %reply_queue.name, "Declared reply queue");

        let lease = ReplyQueueLease {
            channel: channel.clone(),
            name: Some(reply_queue.name.clone()),
        };

        let outcome = self.request(&channel, reply_queue, &id, body).await;
        lease.release().await;

        outcome
    }

    #[instrument(skip(self, data))]
    async fn emit(&self, pattern: &str, data: Payload) -> Result<(), RpcError> {
        let channel = self.channel().await?;
        let body = encode_request(None, pattern, &data).map_err(RpcError::InvalidPayload)?;

        channel
            .publish(&self.queue, body, MessageProperties::default())
            .await
            .map_err(RpcError::Transport)?;
        debug!(queue = %self.queue, "Published event");

        Ok(())
    }
}
