//! In-memory transport for exercising client code without a broker

use super::{ConnectionState, Transport};
use crate::error::RpcError;
use crate::protocol::Payload;
use async_trait::async_trait;
use serde_json::json;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::debug;

/// Call recorded by the [`MockTransport`]
pub type RecordedCall = (String, Payload);

/// Transport that never touches the network
///
/// Every request is answered immediately with `{ "mocked": true, "pattern": .., "data": .. }`
/// and all calls are recorded for later inspection. It still follows the regular
/// [`ConnectionState`] lifecycle so that misuse surfaces in tests.
#[derive(Default)]
pub struct MockTransport {
    state: Mutex<ConnectionState<()>>,
    connected: Mutex<bool>,
    sent: Mutex<Vec<RecordedCall>>,
    emitted: Mutex<Vec<RecordedCall>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MockTransport {
    /// Creates a new, disconnected instance
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether [`connect`](Transport::connect) has been called successfully at some point
    pub fn is_connected(&self) -> bool {
        *lock(&self.connected)
    }

    /// Whether [`close`](Transport::close) has been called
    pub fn is_closed(&self) -> bool {
        lock(&self.state).is_closed()
    }

    /// Requests sent so far, in order
    pub fn sent(&self) -> Vec<RecordedCall> {
        lock(&self.sent).clone()
    }

    /// Events emitted so far, in order
    pub fn emitted(&self) -> Vec<RecordedCall> {
        lock(&self.emitted).clone()
    }

    fn ensure_connected(&self) -> Result<(), RpcError> {
        lock(&self.state).connection().map(|_| ())
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self) -> Result<(), RpcError> {
        let mut state = lock(&self.state);

        if state.needs_connection()? {
            *state = ConnectionState::Connected(());
            *lock(&self.connected) = true;
        }

        Ok(())
    }

    async fn close(&self) -> Result<(), RpcError> {
        lock(&self.state).close();
        Ok(())
    }

    async fn send(&self, pattern: &str, data: Payload) -> Result<Payload, RpcError> {
        self.ensure_connected()?;

        debug!(pattern, "Answering mocked request");
        lock(&self.sent).push((pattern.to_owned(), data.clone()));

        Ok(json!({
            "mocked": true,
            "pattern": pattern,
            "data": data,
        }))
    }

    async fn emit(&self, pattern: &str, data: Payload) -> Result<(), RpcError> {
        self.ensure_connected()?;

        debug!(pattern, "Recording mocked event");
        lock(&self.emitted).push((pattern.to_owned(), data));

        Ok(())
    }
}
