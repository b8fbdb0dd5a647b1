//! The coordinator: the mesh broker's rendezvous/signaling hub.
//!
//! Every new peer speaks this component's WebSocket protocol exactly
//! once, to obtain an alias and (if it's a client) a list of comm-servers
//! to open WebRTC connections to. After that handshake, the coordinator
//! is only a relay for signaling frames addressed by alias; it never
//! looks inside an SDP offer/answer or an ICE candidate.

pub mod central;
pub mod config;
pub mod error;
pub mod selector;
pub mod server;

pub use central::{Central, CentralHandle};
pub use config::CoordinatorConfig;
pub use error::{Error, Result};
pub use selector::{DefaultServerSelector, FixedCountSelector, ServerSelector};
pub use server::CoordinatorServer;
