use std::time::Duration;

use serde::{Deserialize, Serialize};
use webrtc::ice_transport::ice_server::RTCIceServer;

use crate::error::{Error, Result};

/// Comm-server configuration: where to find the coordinator, how to
/// authenticate, which ICE servers to offer peers, and the queue/timing
/// knobs that govern backpressure and reporting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommServerConfig {
    /// Base `ws://` or `wss://` URL of the coordinator's `/discover`
    /// endpoint, without query string.
    pub coordinator_url: String,
    /// Authentication method to present to the coordinator and, in turn,
    /// to require of every connecting peer.
    pub auth_method: String,
    /// Opaque credential handed to the authenticator (method-specific;
    /// the shared-secret authenticator reads it as the token).
    pub auth_token: Option<String>,
    #[serde(default = "default_ice_urls")]
    pub ice_server_urls: Vec<String>,
    #[serde(with = "humantime_secs")]
    pub peer_auth_timeout: Duration,
    pub reliable_queue_size: usize,
    pub unreliable_queue_size: usize,
    #[serde(with = "humantime_secs")]
    pub report_period: Duration,
}

impl Default for CommServerConfig {
    fn default() -> Self {
        Self {
            coordinator_url: "ws://127.0.0.1:8080".to_string(),
            auth_method: "open".to_string(),
            auth_token: None,
            ice_server_urls: default_ice_urls(),
            peer_auth_timeout: Duration::from_secs(10),
            reliable_queue_size: 256,
            unreliable_queue_size: 256,
            report_period: Duration::from_secs(1),
        }
    }
}

fn default_ice_urls() -> Vec<String> {
    vec!["stun:stun.l.google.com:19302".to_string()]
}

impl CommServerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.coordinator_url.is_empty() {
            return Err(Error::Config(
                "coordinator_url must not be empty".to_string(),
            ));
        }
        if self.auth_method.is_empty() {
            return Err(Error::Config("auth_method must not be empty".to_string()));
        }
        if self.reliable_queue_size == 0 || self.unreliable_queue_size == 0 {
            return Err(Error::Config(
                "queue sizes must be at least 1".to_string(),
            ));
        }
        if self.peer_auth_timeout.is_zero() {
            return Err(Error::Config(
                "peer_auth_timeout must be positive".to_string(),
            ));
        }
        if self.report_period.is_zero() {
            return Err(Error::Config("report_period must be positive".to_string()));
        }
        Ok(())
    }

    pub fn discover_url(&self) -> String {
        match &self.auth_token {
            Some(token) => format!(
                "{}/discover?method={}&token={}",
                self.coordinator_url, self.auth_method, token
            ),
            None => format!(
                "{}/discover?method={}",
                self.coordinator_url, self.auth_method
            ),
        }
    }

    pub fn ice_servers(&self) -> Vec<RTCIceServer> {
        self.ice_server_urls
            .iter()
            .map(|url| RTCIceServer {
                urls: vec![url.clone()],
                ..Default::default()
            })
            .collect()
    }
}

/// `Duration` as a plain integer number of seconds, matching the
/// coordinator's config serialization.
mod humantime_secs {
    use super::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(d)?;
        Ok(Duration::from_secs(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(CommServerConfig::default().validate().is_ok());
    }

    #[test]
    fn discover_url_includes_token_when_set() {
        let config = CommServerConfig {
            auth_token: Some("secret".to_string()),
            ..CommServerConfig::default()
        };
        assert!(config.discover_url().contains("token=secret"));
    }

    #[test]
    fn empty_coordinator_url_is_rejected() {
        let config = CommServerConfig {
            coordinator_url: String::new(),
            ..CommServerConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
