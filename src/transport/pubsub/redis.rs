//! Trait implementations using [`redis`](::redis)
//!
//! Requests and events are sent through a shared [`MultiplexedConnection`] using
//! [`PUBLISH`](https://redis.io/commands/publish). As a connection in subscriber mode may not be
//! used for anything else, every reply subscription opens a dedicated connection which is
//! closed again once the subscription stream is dropped. Closing the [`RedisConnection`] drops
//! the publishing connection, requests which are still in flight keep their own handle to it.

use super::{MessageStream, PubSubConnection, PubSubFactory, PubSubTransport};
use crate::error::{BoxedError, EmptyResult};
use crate::options::RedisOptions;
use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client, Msg};
use std::sync::{Mutex, PoisonError};
use tracing::trace;

const CLOSED_MESSAGE: &str = "redis connection has been closed";

/// [`PubSubTransport`] talking to a redis server
pub type RedisTransport = PubSubTransport<RedisFactory>;

impl RedisTransport {
    /// Creates a new, disconnected transport from the given options
    pub fn from_options(options: &RedisOptions) -> Self {
        Self::with_timeout(RedisFactory::new(options.url()), options.response_timeout)
    }
}

/// [`PubSubFactory`] opening connections to a redis server
pub struct RedisFactory {
    url: String,
}

impl RedisFactory {
    /// Creates a new factory opening connections to the given URL
    pub fn new(url: String) -> Self {
        Self { url }
    }
}

#[async_trait]
impl PubSubFactory for RedisFactory {
    type Connection = RedisConnection;

    async fn connect(&self) -> Result<Self::Connection, BoxedError> {
        let client = Client::open(self.url.as_str())?;
        let publisher = client.get_multiplexed_tokio_connection().await?;

        Ok(RedisConnection {
            client,
            publisher: Mutex::new(Some(publisher)),
        })
    }
}

/// Established connection to a redis server
pub struct RedisConnection {
    client: Client,
    publisher: Mutex<Option<MultiplexedConnection>>,
}

impl RedisConnection {
    fn publisher(&self) -> Option<MultiplexedConnection> {
        self.publisher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl PubSubConnection for RedisConnection {
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> EmptyResult {
        let mut con = self.publisher().ok_or(CLOSED_MESSAGE)?;
        let receivers: usize = con.publish(channel, payload.as_slice()).await?;

        trace!(channel, receivers, "Redis PUBLISH");
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<MessageStream, BoxedError> {
        let mut pubsub = self.client.get_async_connection().await?.into_pubsub();
        pubsub.subscribe(channel).await?;

        trace!(channel, "Redis SUBSCRIBE");

        let stream = pubsub
            .into_on_message()
            .map(|msg: Msg| Ok(msg.get_payload_bytes().to_vec()))
            .boxed();

        Ok(stream)
    }

    async fn close(&self) -> EmptyResult {
        // Subscriptions are owned by their streams and end with them
        let publisher = self
            .publisher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if publisher.is_some() {
            trace!("Dropped redis publishing connection");
        }

        Ok(())
    }
}

#[cfg(test)]
mod does {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn reject_publishing_after_close() {
        let connection = RedisConnection {
            client: Client::open("redis://127.0.0.1:1/").unwrap(),
            publisher: Mutex::new(None),
        };

        connection.close().await.unwrap();
        let error = connection.publish("sum", b"{}".to_vec()).await.unwrap_err();

        assert_eq!(error.to_string(), CLOSED_MESSAGE);
    }

    #[tokio::test]
    async fn fail_to_connect_to_unreachable_servers() {
        let factory = RedisFactory::new("redis://127.0.0.1:1/".into());
        let outcome = tokio::time::timeout(Duration::from_secs(5), factory.connect()).await;

        assert!(matches!(outcome, Ok(Err(_))));
    }
}
