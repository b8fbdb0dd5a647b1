//! The authentication collaborator: a pluggable, method-keyed registry of
//! credential validators.
//!
//! The core (coordinator and comm-server) never inspects credentials
//! itself — it only asks a registered [`Authenticator`] to accept or
//! reject a peer, either from the query string of the coordinator's
//! WebSocket upgrade request or from the body of an `AUTH` wire message.

mod error;
mod open;
mod registry;
mod shared_secret;

pub use error::{Error, Result};
pub use open::OpenAuthenticator;
pub use registry::AuthenticatorRegistry;
pub use shared_secret::SharedSecretAuthenticator;

use std::collections::HashMap;

use async_trait::async_trait;
use mesh_wire::Role;

/// Query parameters parsed from a WebSocket upgrade URL, e.g.
/// `?method=shared-secret&token=abc123` becomes `{"method": "shared-secret",
/// "token": "abc123"}`.
pub type QueryParams = HashMap<String, String>;

/// Result of a credential check. `Reject` carries a human-readable reason
/// for the info-level log line the caller emits (authentication failures
/// are never logged at error level).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Accept,
    Reject { reason: String },
}

impl Decision {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Decision::Accept)
    }
}

/// A pluggable credential validator, keyed in the registry by method name.
///
/// Implementations are expected to be cheap to call and side-effect free
/// beyond their own bookkeeping — they run on the coordinator's and
/// comm-server's hot registration/handshake path.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Build the URL a peer should connect to in order to authenticate
    /// via the URL-side path, e.g. appending `?method=...&token=...` to
    /// `base_url`.
    fn generate_auth_url(&self, base_url: &str, role: Role) -> String;

    /// Build the body of the `AUTH` wire message a peer should send over
    /// a comm-server's reliable data channel.
    fn generate_auth_message(&self, role: Role) -> Vec<u8>;

    /// Validate credentials carried in a WebSocket upgrade URL's query
    /// string (used by the coordinator's `/discover` and `/connect`
    /// handshakes).
    async fn authenticate_from_url(&self, role: Role, query: &QueryParams) -> Decision;

    /// Validate credentials carried in an `AUTH` wire message body (used
    /// by the comm-server's per-peer data-channel handshake).
    async fn authenticate_from_message(&self, role: Role, body: &[u8]) -> Decision;
}
