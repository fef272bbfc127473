use super::{Delivery, MessageProperties, QueueChannel, QueueFactory, ReplyQueue};
use crate::error::{BoxedError, EmptyResult};
use async_trait::async_trait;
use futures::channel::mpsc::{unbounded, UnboundedSender};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

type Handler = Arc<dyn Fn(&PublishedMessage) -> Vec<Delivery> + Send + Sync>;

/// Message as it has been handed to the broker
#[derive(Debug, Clone)]
pub struct PublishedMessage {
    pub body: Vec<u8>,
    pub properties: MessageProperties,
}

#[derive(Default)]
struct Inner {
    handlers: HashMap<String, Handler>,
    consumers: HashMap<String, UnboundedSender<Result<Delivery, BoxedError>>>,
    published: Vec<(String, PublishedMessage)>,
    declared: Vec<String>,
    deleted: Vec<String>,
    closed: usize,
}

/// In-process broker answering messages on served queues synchronously
#[derive(Clone, Default)]
pub struct MemoryQueueBroker {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryQueueBroker {
    /// Answers messages published to `queue` with the deliveries returned by `handler`
    ///
    /// Replies are routed to the queue named in the `reply_to` property.
    pub fn serve<H>(&self, queue: &str, handler: H)
    where
        H: Fn(&PublishedMessage) -> Vec<Delivery> + Send + Sync + 'static,
    {
        self.inner
            .lock()
            .unwrap()
            .handlers
            .insert(queue.to_owned(), Arc::new(handler));
    }

    /// Ends all consumers as if the broker went away
    pub fn disconnect(&self) {
        self.inner.lock().unwrap().consumers.clear();
    }

    pub fn published(&self, queue: &str) -> Vec<PublishedMessage> {
        self.inner
            .lock()
            .unwrap()
            .published
            .iter()
            .filter(|(q, _)| q == queue)
            .map(|(_, message)| message.clone())
            .collect()
    }

    pub fn declared_queues(&self) -> Vec<String> {
        self.inner.lock().unwrap().declared.clone()
    }

    pub fn deleted_queues(&self) -> Vec<String> {
        self.inner.lock().unwrap().deleted.clone()
    }

    pub fn closed_channels(&self) -> usize {
        self.inner.lock().unwrap().closed
    }
}

#[async_trait]
impl QueueChannel for MemoryQueueBroker {
    async fn declare_reply_queue(&self) -> Result<ReplyQueue, BoxedError> {
        let mut inner = self.inner.lock().unwrap();
        let name = format!("amq.gen-{}", inner.declared.len());
        let (tx, rx) = unbounded();

        inner.declared.push(name.clone());
        inner.consumers.insert(name.clone(), tx);

        Ok(ReplyQueue {
            name,
            deliveries: rx.boxed(),
        })
    }

    async fn publish(
        &self,
        queue: &str,
        body: Vec<u8>,
        properties: MessageProperties,
    ) -> EmptyResult {
        let message = PublishedMessage { body, properties };

        let handler = {
            let mut inner = self.inner.lock().unwrap();
            inner.published.push((queue.to_owned(), message.clone()));
            inner.handlers.get(queue).cloned()
        };

        let replies = handler.map(|handler| handler(&message)).unwrap_or_default();

        if let Some(reply_to) = &message.properties.reply_to {
            let inner = self.inner.lock().unwrap();

            if let Some(consumer) = inner.consumers.get(reply_to) {
                for reply in replies {
                    consumer.unbounded_send(Ok(reply)).ok();
                }
            }
        }

        Ok(())
    }

    async fn delete_queue(&self, name: &str) -> EmptyResult {
        let mut inner = self.inner.lock().unwrap();
        inner.consumers.remove(name);
        inner.deleted.push(name.to_owned());
        Ok(())
    }

    async fn close(&self) -> EmptyResult {
        self.inner.lock().unwrap().closed += 1;
        Ok(())
    }
}

#[async_trait]
impl QueueFactory for MemoryQueueBroker {
    type Channel = MemoryQueueBroker;

    async fn connect(&self) -> Result<Self::Channel, BoxedError> {
        Ok(self.clone())
    }
}
