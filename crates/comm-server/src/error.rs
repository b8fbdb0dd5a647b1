use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("wire codec error: {0}")]
    Wire(#[from] mesh_wire::Error),

    #[error("auth error: {0}")]
    Auth(#[from] mesh_auth::Error),

    #[error("coordinator websocket error: {0}")]
    Signaling(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("webrtc error: {0}")]
    WebRtc(#[from] webrtc::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal invariant violated: {0}")]
    Invariant(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether a binary should treat this as unrecoverable and exit, as
    /// opposed to logging and continuing with the next peer.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Config(_) | Error::Invariant(_))
    }
}
