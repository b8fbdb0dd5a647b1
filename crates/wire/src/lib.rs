//! Binary wire codec for the mesh broker.
//!
//! Every message on the wire — coordinator-to-peer or peer-to-comm-server —
//! is one [`WireMessage`], encoded as `[tag: u8][fields...]` with no
//! schema negotiation: the tag enumeration is append-only, so old decoders
//! reject new tags cleanly instead of misparsing them.
//!
//! The codec intentionally knows nothing about transport (WebSocket frame
//! vs. WebRTC data channel message) — it only turns a byte buffer into a
//! [`WireMessage`] and back.

mod compression;
mod error;
mod message;

pub use compression::{decode_topic_list, encode_topic_list, TopicListFormat};
pub use error::{Error, Result};
pub use message::{peek_header, peek_topic, Header, Role, WireMessage};

/// Coordinator-assigned peer identifier. Zero is never a valid assigned
/// alias (it is used as a sentinel for "not yet assigned").
pub type Alias = u64;
