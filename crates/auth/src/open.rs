use async_trait::async_trait;
use mesh_wire::Role;

use crate::{Authenticator, Decision, QueryParams};

/// Accepts every peer unconditionally. Intended for local development and
/// the end-to-end test harness, never for a deployment that faces
/// untrusted clients.
pub struct OpenAuthenticator;

#[async_trait]
impl Authenticator for OpenAuthenticator {
    fn generate_auth_url(&self, base_url: &str, _role: Role) -> String {
        format!("{base_url}?method=open")
    }

    fn generate_auth_message(&self, _role: Role) -> Vec<u8> {
        Vec::new()
    }

    async fn authenticate_from_url(&self, _role: Role, _query: &QueryParams) -> Decision {
        Decision::Accept
    }

    async fn authenticate_from_message(&self, _role: Role, _body: &[u8]) -> Decision {
        Decision::Accept
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn accepts_anything() {
        let auth = OpenAuthenticator;
        let decision = auth
            .authenticate_from_message(Role::Client, b"whatever")
            .await;
        assert!(decision.is_accepted());
    }
}
