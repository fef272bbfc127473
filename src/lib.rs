//! Client for calling NestJS style microservices from Rust.
//!
//! Requests are addressed by a *pattern* and carried by a pluggable [`Transport`](transport::Transport)
//! over one of several fire-and-forget substrates. Each transport turns its substrate into a
//! synchronous looking request/response call by attaching a correlation id to every request and
//! matching the asynchronous reply against it.
//!
//! The crate is layered bottom-up:
//!
//! 1. [`protocol`] contains the substrate independent parts: the JSON envelope codec, the
//!    length-prefixed framing used on raw sockets, the registry of pending requests and the
//!    interpretation of response envelopes.
//! 2. [`transport`] contains the substrate adapters (Redis pub/sub, RabbitMQ, NATS, TCP and an
//!    in-memory mock) implementing the common [`Transport`](transport::Transport) trait.
//! 3. [`Client`] is the surface application code talks to.

#![deny(missing_docs)]

mod client;
mod error;

pub mod helpers;
pub mod options;
pub mod protocol;
pub mod transport;

pub use client::Client;
pub use error::{BoxedError, EmptyResult, RemoteError, RpcError};
pub use protocol::{CorrelationId, Payload};
