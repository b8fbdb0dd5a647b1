pub mod central;
pub mod config;
pub mod error;
pub mod peer;
pub mod queue;
pub mod reporter;
pub mod rtc;
pub mod signaling;
pub mod subscription;

pub use central::{Central, CentralHandle};
pub use config::CommServerConfig;
pub use error::{Error, Result};
pub use reporter::{LoggingReporter, PeerSnapshot, Reporter, Snapshot};
pub use rtc::PeerConnectionFactory;
pub use signaling::{CoordinatorLink, SignalingHandle};
