//! Substrate adapters carrying requests and events to remote peers
//!
//! Every adapter implements the [`Transport`] trait on top of a different messaging model:
//!
//! - [`pubsub`] publishes to the pattern and listens for replies on a shared `<pattern>.reply`
//!   channel, with the [`CorrelationRegistry`](crate::protocol::CorrelationRegistry) deciding
//!   which caller a reply belongs to.
//! - [`queue`] declares a private reply queue per request and passes its name along with the
//!   correlation id.
//! - [`request_reply`] relies on the native request/reply API of brokers like NATS, which
//!   deliver each reply to a private inbox of its requester.
//! - [`tcp`] writes length-prefixed frames onto a dedicated socket and serializes
//!   request/response cycles.
//! - [`mock`] keeps everything in memory and echoes requests back.
//!
//! All adapters follow the same lifecycle described by [`ConnectionState`].

mod state;

pub mod mock;
pub mod pubsub;
pub mod queue;
pub mod request_reply;
#[cfg(feature = "tcp")]
pub mod tcp;

pub use state::ConnectionState;

use crate::error::RpcError;
use crate::protocol::Payload;
use async_trait::async_trait;
use std::sync::Arc;

/// Default duration to wait for a reply before failing with [`RpcError::Timeout`]
pub const DEFAULT_RESPONSE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

/// Request/response and fire-and-forget messaging over some substrate
#[async_trait]
pub trait Transport {
    /// Establishes the underlying connection
    ///
    /// Calling this on a connected transport does nothing and never opens a second connection.
    async fn connect(&self) -> Result<(), RpcError>;

    /// Releases the underlying connection and fails all pending requests
    ///
    /// May be called any number of times and regardless of whether a connection has been established.
    async fn close(&self) -> Result<(), RpcError>;

    /// Sends a request to the given pattern and waits for a single reply
    async fn send(&self, pattern: &str, data: Payload) -> Result<Payload, RpcError>;

    /// Publishes an event to the given pattern without waiting for anything in return
    async fn emit(&self, pattern: &str, data: Payload) -> Result<(), RpcError>;
}

#[async_trait]
impl<T> Transport for Arc<T>
where
    T: Transport + Send + Sync + ?Sized,
{
    async fn connect(&self) -> Result<(), RpcError> {
        self.as_ref().connect().await
    }

    async fn close(&self) -> Result<(), RpcError> {
        self.as_ref().close().await
    }

    async fn send(&self, pattern: &str, data: Payload) -> Result<Payload, RpcError> {
        self.as_ref().send(pattern, data).await
    }

    async fn emit(&self, pattern: &str, data: Payload) -> Result<(), RpcError> {
        self.as_ref().emit(pattern, data).await
    }
}

#[async_trait]
impl<T> Transport for Box<T>
where
    T: Transport + Send + Sync + ?Sized,
{
    async fn connect(&self) -> Result<(), RpcError> {
        self.as_ref().connect().await
    }

    async fn close(&self) -> Result<(), RpcError> {
        self.as_ref().close().await
    }

    async fn send(&self, pattern: &str, data: Payload) -> Result<Payload, RpcError> {
        self.as_ref().send(pattern, data).await
    }

    async fn emit(&self, pattern: &str, data: Payload) -> Result<(), RpcError> {
        self.as_ref().emit(pattern, data).await
    }
}

/// Dynamic dispatch version of [`Transport`]
pub type BoxedTransport = Box<dyn Transport + Send + Sync>;
