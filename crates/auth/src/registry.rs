use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::Authenticator;

/// Method-keyed registry of authenticators, injected once at startup and
/// shared read-only thereafter (§5: "the authenticator registry is
/// read-mostly and is shared via `Arc` once initialized").
#[derive(Clone, Default)]
pub struct AuthenticatorRegistry {
    methods: HashMap<String, Arc<dyn Authenticator>>,
}

impl AuthenticatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a method. Returns an error if the name is already taken
    /// rather than silently overwriting it, since a silent duplicate
    /// registration would be a startup configuration mistake.
    pub fn register(
        &mut self,
        method: impl Into<String>,
        authenticator: Arc<dyn Authenticator>,
    ) -> Result<()> {
        let method = method.into();
        if self.methods.contains_key(&method) {
            return Err(Error::DuplicateMethod(method));
        }
        self.methods.insert(method, authenticator);
        Ok(())
    }

    pub fn get(&self, method: &str) -> Option<Arc<dyn Authenticator>> {
        self.methods.get(method).cloned()
    }

    /// Look up a method, failing with a configuration error if absent.
    /// Binaries call this at startup to validate their configured default
    /// method, and at request time to resolve the method named in a
    /// peer's query string / AUTH frame.
    pub fn require(&self, method: &str) -> Result<Arc<dyn Authenticator>> {
        self.get(method)
            .ok_or_else(|| Error::UnknownMethod(method.to_string()))
    }

    pub fn methods(&self) -> impl Iterator<Item = &str> {
        self.methods.keys().map(|s| s.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::OpenAuthenticator;

    #[test]
    fn register_and_require() {
        let mut registry = AuthenticatorRegistry::new();
        registry
            .register("open", Arc::new(OpenAuthenticator))
            .unwrap();
        assert!(registry.require("open").is_ok());
        assert!(registry.require("missing").is_err());
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut registry = AuthenticatorRegistry::new();
        registry
            .register("open", Arc::new(OpenAuthenticator))
            .unwrap();
        let err = registry.register("open", Arc::new(OpenAuthenticator));
        assert!(matches!(err, Err(Error::DuplicateMethod(_))));
    }
}
