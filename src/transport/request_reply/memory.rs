use super::{RequestReplyConnection, RequestReplyFactory};
use crate::error::{BoxedError, EmptyResult};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

type Handler = Arc<dyn Fn(Value) -> Option<Vec<u8>> + Send + Sync>;

/// In-process broker answering requests synchronously
///
/// Handlers returning `None` leave the request unanswered forever.
#[derive(Clone, Default)]
pub struct MemoryRequestBroker {
    handlers: Arc<Mutex<HashMap<String, Handler>>>,
    published: Arc<Mutex<Vec<(String, Vec<u8>)>>>,
    opened: Arc<AtomicUsize>,
    closed: Arc<AtomicUsize>,
}

impl MemoryRequestBroker {
    pub fn serve<H>(&self, subject: &str, handler: H)
    where
        H: Fn(Value) -> Option<Vec<u8>> + Send + Sync + 'static,
    {
        self.handlers
            .lock()
            .unwrap()
            .insert(subject.to_owned(), Arc::new(handler));
    }

    pub fn published_raw(&self, subject: &str) -> Vec<Vec<u8>> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .filter(|(s, _)| s == subject)
            .map(|(_, payload)| payload.clone())
            .collect()
    }

    pub fn requests(&self, subject: &str) -> Vec<Value> {
        self.published_raw(subject)
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

    fn record(&self, subject: &str, payload: &[u8]) {
        self.published
            .lock()
            .unwrap()
            .push((subject.to_owned(), payload.to_vec()));
    }
}

#[async_trait]
impl RequestReplyConnection for MemoryRequestBroker {
    async fn request(&self, subject: &str, payload: Vec<u8>) -> Result<Vec<u8>, BoxedError> {
        self.record(subject, &payload);

        let handler = self
            .handlers
            .lock()
            .unwrap()
            .get(subject)
            .cloned()
            .ok_or("no responders available for request")?;

        match handler(serde_json::from_slice(&payload)?) {
            Some(reply) => Ok(reply),
            None => futures::future::pending().await,
        }
    }

    async fn publish(&self, subject: &str, payload: Vec<u8>) -> EmptyResult {
        self.record(subject, &payload);
        Ok(())
    }

    async fn close(&self) -> EmptyResult {
        self.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl RequestReplyFactory for MemoryRequestBroker {
    type Connection = MemoryRequestBroker;

    async fn connect(&self) -> Result<Self::Connection, BoxedError> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(self.clone())
    }
}
