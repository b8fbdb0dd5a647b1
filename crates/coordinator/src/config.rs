use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Coordinator configuration: listen address, authentication deadline,
/// and per-peer outbound queue capacity (§6 "Configuration inputs").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    pub listen_host: String,
    pub listen_port: u16,
    #[serde(with = "humantime_secs")]
    pub auth_timeout: Duration,
    pub queue_size: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            listen_host: "0.0.0.0".to_string(),
            listen_port: 8080,
            auth_timeout: Duration::from_secs(60),
            queue_size: 256,
        }
    }
}

impl CoordinatorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.listen_host.is_empty() {
            return Err(Error::Config("listen_host must not be empty".to_string()));
        }
        if self.queue_size == 0 {
            return Err(Error::Config("queue_size must be at least 1".to_string()));
        }
        if self.auth_timeout.is_zero() {
            return Err(Error::Config("auth_timeout must be positive".to_string()));
        }
        Ok(())
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.listen_host, self.listen_port)
    }
}

/// `Duration` as a plain integer number of seconds, so the config is
/// readable/writable as ordinary JSON (`serde_with` would be another
/// dependency for one field; this is the smaller surface).
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
        assert!(CoordinatorConfig::default().validate().is_ok());
    }

    #[test]
    fn empty_host_is_rejected() {
        let mut config = CoordinatorConfig::default();
        config.listen_host.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_queue_size_is_rejected() {
        let mut config = CoordinatorConfig {
            queue_size: 0,
            ..CoordinatorConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
