use async_trait::async_trait;
use mesh_wire::Role;

use crate::{Authenticator, Decision, QueryParams};

/// Checks a single pre-shared token byte-for-byte against the `AUTH`
/// body (data-channel path) or the `token` query parameter (WebSocket
/// path). This is deliberately not a real identity system — it exists so
/// the registry is non-empty and the `Authenticator` trait is exercised
/// honestly by something other than the always-accept case.
pub struct SharedSecretAuthenticator {
    token: String,
}

impl SharedSecretAuthenticator {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl Authenticator for SharedSecretAuthenticator {
    fn generate_auth_url(&self, base_url: &str, _role: Role) -> String {
        format!("{base_url}?method=shared-secret&token={}", self.token)
    }

    fn generate_auth_message(&self, _role: Role) -> Vec<u8> {
        self.token.clone().into_bytes()
    }

    async fn authenticate_from_url(&self, _role: Role, query: &QueryParams) -> Decision {
        match query.get("token") {
            Some(token) if token == &self.token => Decision::Accept,
            Some(_) => Decision::Reject {
                reason: "token mismatch".to_string(),
            },
            None => Decision::Reject {
                reason: "missing token query parameter".to_string(),
            },
        }
    }

    async fn authenticate_from_message(&self, _role: Role, body: &[u8]) -> Decision {
        if body == self.token.as_bytes() {
            Decision::Accept
        } else {
            Decision::Reject {
                reason: "token mismatch".to_string(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn accepts_matching_token() {
        let auth = SharedSecretAuthenticator::new("secret");
        let decision = auth
            .authenticate_from_message(Role::CommunicationServer, b"secret")
            .await;
        assert!(decision.is_accepted());
    }

    #[tokio::test]
    async fn rejects_mismatched_token() {
        let auth = SharedSecretAuthenticator::new("secret");
        let decision = auth
            .authenticate_from_message(Role::Client, b"wrong")
            .await;
        assert!(!decision.is_accepted());
    }

    #[tokio::test]
    async fn url_path_checks_token_query_param() {
        let auth = SharedSecretAuthenticator::new("secret");
        let mut query = QueryParams::new();
        query.insert("token".to_string(), "secret".to_string());
        assert!(auth.authenticate_from_url(Role::Client, &query).await.is_accepted());

        query.insert("token".to_string(), "nope".to_string());
        assert!(!auth.authenticate_from_url(Role::Client, &query).await.is_accepted());
    }
}
