//! Request/response over a single TCP connection
//!
//! Envelopes are written as length-prefixed frames (see [`framing`](crate::protocol::framing)).
//! As a byte stream provides no way to tell whose reply is arriving, request/response cycles are
//! serialized: the reply to one request is read before the next request is written. Events only
//! take the writer lock and may thus be written while a request is waiting for its reply.
//!
//! Once the peer hangs up, every waiting and subsequent call fails with
//! [`RpcError::ConnectionLost`] until [`connect`](Transport::connect) establishes a new connection.
//!
//! Requests which have been abandoned (timed out or cancelled) are remembered for a while so
//! that their late replies can be skipped instead of being mistaken for the reply of a
//! subsequent request.

use super::{ConnectionState, Transport, DEFAULT_RESPONSE_TIMEOUT};
use crate::error::RpcError;
use crate::options::TcpOptions;
use crate::protocol::framing::{encode_frame, read_frame, FrameDecoder};
use crate::protocol::{
    decode_response, encode_request, parse_response, CorrelationId, Payload, ResponseEnvelope,
};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};
use tokio::time::timeout;
use tracing::{debug, info, instrument, trace, warn};

/// Number of abandoned correlation ids remembered per connection
const STALE_ID_CAPACITY: usize = 64;

/// [`Transport`] implementation speaking length-prefixed JSON over TCP
pub struct TcpTransport {
    address: String,
    response_timeout: Duration,
    state: Mutex<ConnectionState<Arc<TcpConnection>>>,
}

impl TcpTransport {
    /// Creates a new, disconnected transport for the given `host:port` address
    pub fn new(address: impl Into<String>) -> Self {
        Self::with_timeout(address, DEFAULT_RESPONSE_TIMEOUT)
    }

    /// Creates a new, disconnected transport waiting at most `response_timeout` for replies
    pub fn with_timeout(address: impl Into<String>, response_timeout: Duration) -> Self {
        Self {
            address: address.into(),
            response_timeout,
            state: Mutex::new(ConnectionState::Disconnected),
        }
    }

    /// Creates a new, disconnected transport from the given options
    pub fn from_options(options: &TcpOptions) -> Self {
        Self::with_timeout(options.address(), options.response_timeout)
    }

    async fn connection(&self) -> Result<Arc<TcpConnection>, RpcError> {
        self.state.lock().await.connection().map(Arc::clone)
    }
}

struct TcpConnection {
    reader: Mutex<FrameReader>,
    writer: Mutex<OwnedWriteHalf>,
    shutdown: watch::Sender<bool>,
    closed: watch::Receiver<bool>,
}

impl TcpConnection {
    fn new(stream: TcpStream) -> Self {
        let (read_half, write_half) = stream.into_split();
        let (shutdown, closed) = watch::channel(false);

        Self {
            reader: Mutex::new(FrameReader {
                stream: read_half,
                decoder: FrameDecoder::new(),
                stale: VecDeque::with_capacity(STALE_ID_CAPACITY),
            }),
            writer: Mutex::new(write_half),
            shutdown,
            closed,
        }
    }

    /// Whether the connection has been shut down or went away
    fn is_lost(&self) -> bool {
        *self.closed.borrow()
    }

    /// Marks the connection as unusable, failing every request waiting for the reader
    fn mark_lost(&self) {
        if !self.is_lost() {
            warn!("TCP connection lost");
            self.shutdown.send(true).ok();
        }
    }

    /// Marks the connection as lost if the given outcome indicates a broken socket
    fn observe<T>(&self, outcome: Result<T, RpcError>) -> Result<T, RpcError> {
        if let Err(RpcError::ConnectionLost | RpcError::Transport(_)) = &outcome {
            self.mark_lost();
        }

        outcome
    }

    async fn write(&self, body: &[u8]) -> Result<(), RpcError> {
        if self.is_lost() {
            return Err(RpcError::ConnectionLost);
        }

        let frame = encode_frame(body);
        let written = self.writer.lock().await.write_all(&frame).await;
        self.observe(written.map_err(RpcError::io))?;

        trace!(bytes = frame.len(), "Wrote frame");
        Ok(())
    }

    async fn exchange(
        &self,
        id: &CorrelationId,
        body: &[u8],
        response_timeout: Duration,
    ) -> Result<ResponseEnvelope, RpcError> {
        let mut reader = self.reader.lock().await;

        // Until the matching reply has been read, any frame carrying this id is a late one
        reader.abandon(id.clone());

        self.write(body).await?;

        let reply = timeout(response_timeout, reader.read_reply(id))
            .await
            .map_err(|_| RpcError::Timeout)?;

        self.observe(reply)
    }

    async fn shutdown(&self) {
        self.shutdown.send(true).ok();

        if let Err(error) = self.writer.lock().await.shutdown().await {
            warn!(%error, "Unable to shut down TCP connection");
        }
    }
}

struct FrameReader {
    stream: OwnedReadHalf,
    decoder: FrameDecoder,
    stale: VecDeque<CorrelationId>,
}

impl FrameReader {
    fn abandon(&mut self, id: CorrelationId) {
        if self.stale.len() == STALE_ID_CAPACITY {
            self.stale.pop_front();
        }

        self.stale.push_back(id);
    }

    fn forget(&mut self, id: &CorrelationId) -> bool {
        match self.stale.iter().position(|stale| stale == id) {
            Some(index) => self.stale.remove(index).is_some(),
            None => false,
        }
    }

    async fn read_reply(&mut self, expected: &CorrelationId) -> Result<ResponseEnvelope, RpcError> {
        loop {
            let frame = read_frame(&mut self.stream, &mut self.decoder).await?;
            let envelope = decode_response(&frame)?;

            match &envelope.id {
                Some(id) if id == expected => {
                    self.forget(expected);
                    return Ok(envelope);
                }
                Some(id) if self.forget(id) => {
                    debug!(%id, "Skipping late reply to abandoned request");
                }
                received => {
                    return Err(RpcError::CorrelationMismatch {
                        expected: expected.clone(),
                        received: received.as_ref().map(ToString::to_string),
                    });
                }
            }
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn connect(&self) -> Result<(), RpcError> {
        let mut state = self.state.lock().await;

        let lost = matches!(&*state, ConnectionState::Connected(connection) if connection.is_lost());

        if lost || state.needs_connection()? {
            let stream = TcpStream::connect(&self.address)
                .await
                .map_err(RpcError::transport)?;
            stream.set_nodelay(true).map_err(RpcError::transport)?;

            *state = ConnectionState::Connected(Arc::new(TcpConnection::new(stream)));
            info!(address = %self.address, reconnected = lost, "Connected to TCP endpoint");
        }

        Ok(())
    }

    async fn close(&self) -> Result<(), RpcError> {
        let connection = self.state.lock().await.close();

        if let Some(connection) = connection {
            connection.shutdown().await;
            info!(address = %self.address, "Closed TCP connection");
        }

        Ok(())
    }

    #[instrument(skip(self, data), fields(id))]
    async fn send(&self, pattern: &str, data: Payload) -> Result<Payload, RpcError> {
        let connection = self.connection().await?;
        let id = CorrelationId::new();
        tracing::Span::current().record("id", &id.as_str());

        let body = encode_request(Some(&id), pattern, &data).map_err(RpcError::InvalidPayload)?;

        let mut closed = connection.closed.clone();
        if connection.is_lost() {
            return Err(RpcError::ConnectionLost);
        }

        let envelope = tokio::select! {
            envelope = connection.exchange(&id, &body, self.response_timeout) => envelope?,
            _ = closed.changed() => return Err(RpcError::ConnectionLost),
        };

        debug!("Received reply");
        parse_response(envelope)
    }

    #[instrument(skip(self, data))]
    async fn emit(&self, pattern: &str, data: Payload) -> Result<(), RpcError> {
        let connection = self.connection().await?;
        let body = encode_request(None, pattern, &data).map_err(RpcError::InvalidPayload)?;

        connection.write(&body).await?;
        debug!("Wrote event");

        Ok(())
    }
}
