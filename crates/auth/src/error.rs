use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while resolving an authentication method. These are
/// configuration errors in the broker's taxonomy: unknown methods are
/// caught at startup when a binary validates its configured default
/// method name against the registry, not at request time.
#[derive(Debug, Error)]
pub enum Error {
    #[error("no authenticator registered for method {0:?}")]
    UnknownMethod(String),

    #[error("method name {0:?} is already registered")]
    DuplicateMethod(String),
}

impl Error {
    pub fn is_fatal(&self) -> bool {
        true
    }
}
