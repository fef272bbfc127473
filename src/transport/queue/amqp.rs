//! Trait implementations using [`lapin`]
//!
//! Requests are published through the default exchange, routing them straight to the queue
//! with the configured name. Reply queues are server-named, exclusive and auto-deleting so the
//! broker cleans up after clients which vanish without deleting them. Connections are driven by
//! the tokio runtime they are established on.

use super::{Delivery, MessageProperties, QueueChannel, QueueFactory, QueueTransport, ReplyQueue};
use crate::error::{BoxedError, EmptyResult};
use crate::options::RabbitMqOptions;
use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicConsumeOptions, BasicPublishOptions, QueueDeclareOptions, QueueDeleteOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use tracing::trace;

const DEFAULT_EXCHANGE: &str = "";
const REPLY_OK: u16 = 200;

/// [`QueueTransport`] talking to an AMQP 0-9-1 broker like RabbitMQ
pub type RabbitMqTransport = QueueTransport<AmqpFactory>;

impl RabbitMqTransport {
    /// Creates a new, disconnected transport from the given options
    pub fn from_options(options: &RabbitMqOptions) -> Self {
        Self::with_timeout(
            AmqpFactory::new(options.url.clone()),
            options.queue.clone(),
            options.response_timeout,
        )
    }
}

/// [`QueueFactory`] opening connections to an AMQP broker
pub struct AmqpFactory {
    url: String,
}

impl AmqpFactory {
    /// Creates a new factory connecting to the given `amqp://` URL
    pub fn new(url: String) -> Self {
        Self { url }
    }
}

#[async_trait]
impl QueueFactory for AmqpFactory {
    type Channel = AmqpChannel;

    async fn connect(&self) -> Result<Self::Channel, BoxedError> {
        let properties = ConnectionProperties::default()
            .with_executor(tokio_executor_trait::Tokio::current())
            .with_reactor(tokio_reactor_trait::Tokio);

        let connection = Connection::connect(&self.url, properties).await?;
        let channel = connection.create_channel().await?;

        Ok(AmqpChannel {
            connection,
            channel,
        })
    }
}

/// Channel on an established AMQP connection
pub struct AmqpChannel {
    connection: Connection,
    channel: Channel,
}

#[async_trait]
impl QueueChannel for AmqpChannel {
    async fn declare_reply_queue(&self) -> Result<ReplyQueue, BoxedError> {
        let options = QueueDeclareOptions {
            exclusive: true,
            auto_delete: true,
            ..QueueDeclareOptions::default()
        };

        let queue = self
            .channel
            .queue_declare("", options, FieldTable::default())
            .await?;
        let name = queue.name().as_str().to_owned();

        let consume_options = BasicConsumeOptions {
            no_ack: true,
            ..BasicConsumeOptions::default()
        };

        let consumer = self
            .channel
            .basic_consume(&name, "", consume_options, FieldTable::default())
            .await?;

        trace!(queue = %name, "AMQP consuming reply queue");

        let deliveries = consumer
            .map(|delivery| {
                delivery
                    .map(|delivery| Delivery {
                        correlation_id: delivery
                            .properties
                            .correlation_id()
                            .as_ref()
                            .map(|id| id.as_str().to_owned()),
                        body: delivery.data,
                    })
                    .map_err(BoxedError::from)
            })
            .boxed();

        Ok(ReplyQueue { name, deliveries })
    }

    async fn publish(
        &self,
        queue: &str,
        body: Vec<u8>,
        properties: MessageProperties,
    ) -> EmptyResult {
        let mut amqp_properties = BasicProperties::default();

        if let Some(correlation_id) = properties.correlation_id {
            amqp_properties = amqp_properties.with_correlation_id(correlation_id.into());
        }

        if let Some(reply_to) = properties.reply_to {
            amqp_properties = amqp_properties.with_reply_to(reply_to.into());
        }

        self.channel
            .basic_publish(
                DEFAULT_EXCHANGE,
                queue,
                BasicPublishOptions::default(),
                &body,
                amqp_properties,
            )
            .await?
            .await?;

        trace!(queue, "AMQP basic.publish");
        Ok(())
    }

    async fn delete_queue(&self, name: &str) -> EmptyResult {
        self.channel
            .queue_delete(name, QueueDeleteOptions::default())
            .await?;

        trace!(queue = name, "AMQP queue.delete");
        Ok(())
    }

    async fn close(&self) -> EmptyResult {
        self.channel.close(REPLY_OK, "OK").await?;
        self.connection.close(REPLY_OK, "OK").await?;
        Ok(())
    }
}
