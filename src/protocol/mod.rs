//! Substrate independent request/response protocol
//!
//! Every transport shares the same JSON envelopes: requests are sent as `{ id, pattern, data }`
//! (with `id` omitted for fire-and-forget events) and replies arrive as `{ id, response }` or
//! `{ id, err }`. Replies are matched to their requests through the [`CorrelationRegistry`]
//! and unwrapped by [`parse_response`] so that remote errors look identical no matter which
//! substrate carried them.
//!
//! Raw byte streams lack message boundaries and additionally use the length-prefixed
//! framing from the [`framing`] module.

mod envelope;
mod registry;
mod response;

pub mod framing;

pub use envelope::*;
pub use registry::*;
pub use response::*;
