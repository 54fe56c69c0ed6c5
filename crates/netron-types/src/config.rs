//! Netron node configuration.

use crate::error::{NetronError, NetronResult};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

/// Default maximum single frame size (16 MB).
pub const DEFAULT_MAX_MESSAGE_SIZE: u32 = 16 * 1024 * 1024;

/// Serde helper for `Option<Duration>` as milliseconds.
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    /// Serialize `Duration` as `u64` milliseconds.
    pub fn serialize<S: Serializer>(dur: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match dur {
            Some(d) => (d.as_millis() as u64).serialize(s),
            None => s.serialize_none(),
        }
    }

    /// Deserialize `u64` milliseconds into `Duration`.
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        let opt: Option<u64> = Option::deserialize(d)?;
        Ok(opt.map(Duration::from_millis))
    }
}

/// Configuration of a Netron node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetronConfig {
    /// This node's unique ID.
    pub node_id: String,
    /// This node's human-readable name.
    pub node_name: String,
    /// Address the TCP listener binds to.
    pub listen_addr: SocketAddr,
    /// How long a request may wait for its response. `None` waits until the
    /// peer disconnects.
    #[serde(
        rename = "response_timeout_ms",
        with = "duration_ms",
        skip_serializing_if = "Option::is_none"
    )]
    pub response_timeout: Option<Duration>,
    /// Largest frame accepted from or sent to a peer.
    pub max_message_size: u32,
    /// Buffer size of each peer's event channel.
    pub event_capacity: usize,
}

impl Default for NetronConfig {
    fn default() -> Self {
        Self {
            node_id: uuid::Uuid::new_v4().to_string(),
            node_name: "netron-node".to_string(),
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            response_timeout: None,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            event_capacity: 256,
        }
    }
}

impl NetronConfig {
    /// Configuration with a fixed node id and name, defaults elsewhere.
    pub fn named(node_id: impl Into<String>, node_name: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            node_name: node_name.into(),
            ..Self::default()
        }
    }

    /// Parse a TOML document, failing on any error.
    pub fn from_toml_str(contents: &str) -> NetronResult<Self> {
        let config: Self =
            toml::from_str(contents).map_err(|e| NetronError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the protocol cannot work with.
    pub fn validate(&self) -> NetronResult<()> {
        if self.node_id.is_empty() {
            return Err(NetronError::Config("node_id must not be empty".into()));
        }
        if self.max_message_size < 4 {
            return Err(NetronError::Config(format!(
                "max_message_size too small: {}",
                self.max_message_size
            )));
        }
        if self.event_capacity == 0 {
            return Err(NetronError::Config("event_capacity must be positive".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = NetronConfig::default();
        assert_eq!(config.node_name, "netron-node");
        assert!(!config.node_id.is_empty());
        assert_eq!(config.response_timeout, None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_toml_partial() {
        let config = NetronConfig::from_toml_str(
            r#"
            node_id = "node-a"
            listen_addr = "0.0.0.0:7070"
            response_timeout_ms = 1500
            "#,
        )
        .unwrap();
        assert_eq!(config.node_id, "node-a");
        assert_eq!(config.node_name, "netron-node");
        assert_eq!(config.listen_addr.port(), 7070);
        assert_eq!(config.response_timeout, Some(Duration::from_millis(1500)));
    }

    #[test]
    fn test_from_toml_rejects_bad_values() {
        let err = NetronConfig::from_toml_str("event_capacity = 0").unwrap_err();
        assert!(matches!(err, NetronError::Config(_)));
        let err = NetronConfig::from_toml_str("node_name = [").unwrap_err();
        assert!(matches!(err, NetronError::Config(_)));
    }
}
