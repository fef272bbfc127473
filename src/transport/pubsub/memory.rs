use super::{MessageStream, PubSubConnection, PubSubFactory};
use crate::error::{BoxedError, EmptyResult};
use async_trait::async_trait;
use futures::channel::mpsc::{unbounded, UnboundedSender};
use futures::StreamExt;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

type Subscribers = HashMap<String, Vec<UnboundedSender<Result<Vec<u8>, BoxedError>>>>;

/// In-process broker delivering every published message to all current subscribers
#[derive(Clone, Default)]
pub struct MemoryBroker {
    subscribers: Arc<Mutex<Subscribers>>,
    published: Arc<Mutex<Vec<(String, Vec<u8>)>>>,
    opened: Arc<AtomicUsize>,
    closed: Arc<AtomicUsize>,
}

impl MemoryBroker {
    /// Spawns a peer answering requests on `pattern` with the envelopes returned by `handler`
    pub async fn serve<H>(&self, pattern: &str, handler: H)
    where
        H: Fn(Value) -> Vec<Value> + Send + 'static,
    {
        let mut requests = self.subscribe(pattern).await.unwrap();
        let reply_channel = super::reply_channel(pattern);
        let broker = self.clone();

        tokio::spawn(async move {
            while let Some(Ok(bytes)) = requests.next().await {
                let request: Value = serde_json::from_slice(&bytes).unwrap();

                for reply in handler(request) {
                    let payload = serde_json::to_vec(&reply).unwrap();
                    broker.publish(&reply_channel, payload).await.unwrap();
                }
            }
        });
    }

    /// Drops all subscriptions as if the broker went away
    pub fn disconnect(&self) {
        self.subscribers.lock().unwrap().clear();
    }

    /// Number of live subscriptions on a channel
    pub fn subscriber_count(&self, channel: &str) -> usize {
        let mut subscribers = self.subscribers.lock().unwrap();

        match subscribers.get_mut(channel) {
            Some(senders) => {
                senders.retain(|sender| !sender.is_closed());
                senders.len()
            }
            None => 0,
        }
    }

    pub fn published_raw(&self, channel: &str) -> Vec<Vec<u8>> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .filter(|(c, _)| c == channel)
            .map(|(_, payload)| payload.clone())
            .collect()
    }

    pub fn published_on(&self, channel: &str) -> Vec<Value> {
        self.published_raw(channel)
            .iter()
            .map(|payload| serde_json::from_slice(payload).unwrap())
            .collect()
    }

    pub fn opened_connections(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn closed_connections(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PubSubConnection for MemoryBroker {
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> EmptyResult {
        self.published
            .lock()
            .unwrap()
            .push((channel.to_owned(), payload.clone()));

        if let Some(senders) = self.subscribers.lock().unwrap().get_mut(channel) {
            senders.retain(|sender| sender.unbounded_send(Ok(payload.clone())).is_ok());
        }

        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<MessageStream, BoxedError> {
        let (tx, rx) = unbounded();

        self.subscribers
            .lock()
            .unwrap()
            .entry(channel.to_owned())
            .or_default()
            .push(tx);

        Ok(rx.boxed())
    }

    async fn close(&self) -> EmptyResult {
        self.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl PubSubFactory for MemoryBroker {
    type Connection = MemoryBroker;

    async fn connect(&self) -> Result<Self::Connection, BoxedError> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(self.clone())
    }
}
