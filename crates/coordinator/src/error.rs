use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Coordinator-level error taxonomy, following the six buckets in the
/// broker's error handling design.
#[derive(Debug, Error)]
pub enum Error {
    #[error("transport error: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("wire protocol error: {0}")]
    Wire(#[from] mesh_wire::Error),

    #[error("authentication error: {0}")]
    Auth(#[from] mesh_auth::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invariant violation: {0}")]
    Invariant(String),
}

impl Error {
    /// Configuration errors and invariant violations are fatal; every
    /// other bucket is contained to the one peer that triggered it.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Config(_) | Error::Invariant(_))
    }
}
