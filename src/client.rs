use crate::error::RpcError;
use crate::protocol::Payload;
use crate::transport::Transport;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use tracing::warn;

/// Facade over a [`Transport`] for talking to a microservice
///
/// It adds no behaviour of its own apart from typed convenience methods and scoped usage. All
/// errors are passed through from the transport unchanged.
///
/// ```no_run
/// # use nest_rpc_client::{Client, RpcError};
/// # use nest_rpc_client::transport::tcp::TcpTransport;
/// # use serde_json::json;
/// # async fn run() -> Result<(), RpcError> {
/// let client = Client::new(TcpTransport::new("localhost:3000"));
///
/// let sum = client
///     .scoped(|client| async move { client.send("sum", json!({ "a": 1, "b": 2 })).await })
///     .await?;
/// # Ok(())
/// # }
/// ```
pub struct Client<T> {
    transport: T,
}

impl<T> Client<T>
where
    T: Transport,
{
    /// Wraps a transport, no connection is established yet
    pub fn new(transport: T) -> Self {
        Self { transport }
    }

    /// Establishes the underlying connection
    pub async fn connect(&self) -> Result<(), RpcError> {
        self.transport.connect().await
    }

    /// Releases the underlying connection, failing all pending requests
    pub async fn close(&self) -> Result<(), RpcError> {
        self.transport.close().await
    }

    /// Sends a request and waits for its reply
    pub async fn send(&self, pattern: &str, data: Payload) -> Result<Payload, RpcError> {
        self.transport.send(pattern, data).await
    }

    /// Sends an event without waiting for any reply
    pub async fn emit(&self, pattern: &str, data: Payload) -> Result<(), RpcError> {
        self.transport.emit(pattern, data).await
    }

    /// Sends a request with a serializable payload and deserializes the reply
    pub async fn request<Req, Res>(&self, pattern: &str, data: &Req) -> Result<Res, RpcError>
    where
        Req: Serialize + ?Sized,
        Res: DeserializeOwned,
    {
        let data = serde_json::to_value(data).map_err(RpcError::InvalidPayload)?;
        let reply = self.send(pattern, data).await?;

        serde_json::from_value(reply).map_err(RpcError::InvalidPayload)
    }

    /// Sends an event with a serializable payload
    pub async fn notify<Req>(&self, pattern: &str, data: &Req) -> Result<(), RpcError>
    where
        Req: Serialize + ?Sized,
    {
        let data = serde_json::to_value(data).map_err(RpcError::InvalidPayload)?;
        self.emit(pattern, data).await
    }

    /// Connects, runs the given body and closes the transport again
    ///
    /// The transport is closed regardless of whether the body succeeded. An error returned by
    /// the body takes precedence over one raised while closing.
    pub async fn scoped<'a, F, Fut, R>(&'a self, body: F) -> Result<R, RpcError>
    where
        F: FnOnce(&'a Self) -> Fut,
        Fut: Future<Output = Result<R, RpcError>> + 'a,
    {
        if let Err(error) = self.connect().await {
            self.close().await.ok();
            return Err(error);
        }

        let result = body(self).await;
        let closed = self.close().await;

        match (result, closed) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(error)) => Err(error),
            (Err(error), closed) => {
                if let Err(close_error) = closed {
                    warn!(%close_error, "Unable to close transport after failure");
                }

                Err(error)
            }
        }
    }

    /// Underlying transport
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Unwraps the underlying transport
    pub fn into_inner(self) -> T {
        self.transport
    }
}
