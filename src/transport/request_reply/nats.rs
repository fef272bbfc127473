//! Trait implementations using [`async_nats`]
//!
//! Requests use the native request/reply API, replies arrive on a private inbox subject of the
//! client. Closing flushes outstanding messages and drops the client, which terminates the
//! connection once no request holds on to it anymore.

use super::{RequestReplyConnection, RequestReplyFactory, RequestReplyTransport};
use crate::error::{BoxedError, EmptyResult};
use crate::options::NatsOptions;
use async_nats::{Client, ConnectOptions, ServerAddr};
use async_trait::async_trait;
use std::sync::{Mutex, PoisonError};
use tracing::trace;

const CLOSED_MESSAGE: &str = "nats connection has been closed";

/// [`RequestReplyTransport`] talking to a NATS cluster
pub type NatsTransport = RequestReplyTransport<NatsFactory>;

impl NatsTransport {
    /// Creates a new, disconnected transport from the given options
    pub fn from_options(options: &NatsOptions) -> Self {
        Self::with_timeout(
            NatsFactory::new(options.servers.clone()),
            options.response_timeout,
        )
    }
}

/// [`RequestReplyFactory`] opening connections to a NATS cluster
pub struct NatsFactory {
    servers: Vec<String>,
}

impl NatsFactory {
    /// Creates a new factory connecting to any of the given `nats://` URLs
    pub fn new(servers: Vec<String>) -> Self {
        Self { servers }
    }
}

#[async_trait]
impl RequestReplyFactory for NatsFactory {
    type Connection = NatsConnection;

    async fn connect(&self) -> Result<Self::Connection, BoxedError> {
        let servers = self
            .servers
            .iter()
            .map(|server| server.parse::<ServerAddr>())
            .collect::<Result<Vec<_>, _>>()?;

        if servers.is_empty() {
            return Err("no nats servers configured".into());
        }

        // Replies are awaited with the response timeout of the transport
        let client = ConnectOptions::new()
            .request_timeout(None)
            .connect(servers.as_slice())
            .await?;

        trace!(servers = ?self.servers, "NATS connected");

        Ok(NatsConnection {
            client: Mutex::new(Some(client)),
        })
    }
}

/// Established connection to a NATS cluster
pub struct NatsConnection {
    client: Mutex<Option<Client>>,
}

impl NatsConnection {
    fn client(&self) -> Result<Client, BoxedError> {
        self.client
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| CLOSED_MESSAGE.into())
    }
}

#[async_trait]
impl RequestReplyConnection for NatsConnection {
    async fn request(&self, subject: &str, payload: Vec<u8>) -> Result<Vec<u8>, BoxedError> {
        let reply = self
            .client()?
            .request(subject.to_owned(), payload.into())
            .await?;

        trace!(subject, "NATS request answered");
        Ok(reply.payload.to_vec())
    }

    async fn publish(&self, subject: &str, payload: Vec<u8>) -> EmptyResult {
        let client = self.client()?;
        client.publish(subject.to_owned(), payload.into()).await?;
        client.flush().await?;

        trace!(subject, "NATS publish");
        Ok(())
    }

    async fn close(&self) -> EmptyResult {
        let client = self
            .client
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(client) = client {
            client.flush().await?;
            trace!("NATS connection released");
        }

        Ok(())
    }
}
