//! Node configuration
//!
//! A TOML file with `[node]`, `[dht]`, `[mesh]`, and `[pubsub]` sections;
//! every field has the deployed default, so an empty file is a valid
//! configuration. Values are validated before the node starts.

use anyhow::{Context, Result};
use lib_dht::DhtConfig;
use lib_mesh::MeshConfig;
use lib_pubsub::PubSubConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct NodeConfig {
    #[serde(default)]
    pub node: NodeSection,
    #[serde(default)]
    pub dht: DhtSection,
    #[serde(default)]
    pub mesh: MeshSection,
    #[serde(default)]
    pub pubsub: PubSubSection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct NodeSection {
    /// Rendezvous service; `None` starts the node without a bootstrap.
    pub bootstrap_url: Option<String>,
    /// WebSocket listener bind address.
    pub listen_addr: Option<String>,
    /// Address other peers should dial; derived from the listener when
    /// unset.
    pub advertise_addr: Option<String>,
    /// Local store snapshot location.
    pub store_path: Option<PathBuf>,
    /// Identity seed location; a fresh identity is generated when unset.
    pub identity_path: Option<PathBuf>,
}

impl Default for NodeSection {
    fn default() -> Self {
        NodeSection {
            bootstrap_url: Some("ws://127.0.0.1:8080".to_string()),
            listen_addr: Some("0.0.0.0:9470".to_string()),
            advertise_addr: None,
            store_path: None,
            identity_path: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct DhtSection {
    pub k: usize,
    pub alpha: usize,
    pub replicate_k: usize,
    pub refresh_interval_secs: u64,
    pub aggressive_refresh_interval_secs: u64,
    pub standard_refresh_interval_secs: u64,
    pub republish_interval_secs: u64,
    pub expire_interval_secs: u64,
    pub ping_interval_secs: u64,
    pub find_node_min_interval_secs: u64,
    pub request_timeout_secs: u64,
    pub peer_failure_threshold: u32,
    pub peer_backoff_secs: u64,
}

impl Default for DhtSection {
    fn default() -> Self {
        let defaults = DhtConfig::default();
        DhtSection {
            k: defaults.k,
            alpha: defaults.alpha,
            replicate_k: defaults.replicate_k,
            refresh_interval_secs: defaults.refresh_interval.as_secs(),
            aggressive_refresh_interval_secs: defaults.aggressive_refresh_interval.as_secs(),
            standard_refresh_interval_secs: defaults.standard_refresh_interval.as_secs(),
            republish_interval_secs: defaults.republish_interval.as_secs(),
            expire_interval_secs: defaults.expire_interval.as_secs(),
            ping_interval_secs: defaults.ping_interval.as_secs(),
            find_node_min_interval_secs: defaults.find_node_min_interval.as_secs(),
            request_timeout_secs: defaults.request_timeout.as_secs(),
            peer_failure_threshold: defaults.peer_failure_threshold,
            peer_backoff_secs: defaults.peer_backoff_duration.as_secs(),
        }
    }
}

impl DhtSection {
    pub fn to_config(&self) -> DhtConfig {
        DhtConfig {
            k: self.k,
            alpha: self.alpha,
            replicate_k: self.replicate_k,
            refresh_interval: Duration::from_secs(self.refresh_interval_secs),
            aggressive_refresh_interval: Duration::from_secs(self.aggressive_refresh_interval_secs),
            standard_refresh_interval: Duration::from_secs(self.standard_refresh_interval_secs),
            republish_interval: Duration::from_secs(self.republish_interval_secs),
            expire_interval: Duration::from_secs(self.expire_interval_secs),
            ping_interval: Duration::from_secs(self.ping_interval_secs),
            find_node_min_interval: Duration::from_secs(self.find_node_min_interval_secs),
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            peer_failure_threshold: self.peer_failure_threshold,
            peer_backoff_duration: Duration::from_secs(self.peer_backoff_secs),
            ..DhtConfig::default()
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct MeshSection {
    pub message_timeout_secs: u64,
    pub max_queue_size: usize,
    pub message_deduplication_timeout_secs: u64,
    pub max_message_bytes: usize,
}

impl Default for MeshSection {
    fn default() -> Self {
        let defaults = MeshConfig::default();
        MeshSection {
            message_timeout_secs: defaults.message_timeout.as_secs(),
            max_queue_size: defaults.max_queue_size,
            message_deduplication_timeout_secs: defaults
                .message_deduplication_timeout
                .as_secs(),
            max_message_bytes: defaults.max_message_bytes,
        }
    }
}

impl MeshSection {
    pub fn to_config(&self) -> MeshConfig {
        MeshConfig {
            message_timeout: Duration::from_secs(self.message_timeout_secs),
            max_queue_size: self.max_queue_size,
            message_deduplication_timeout: Duration::from_secs(
                self.message_deduplication_timeout_secs,
            ),
            max_message_bytes: self.max_message_bytes,
            ..MeshConfig::default()
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct PubSubSection {
    pub batch_size: usize,
    pub batch_time_ms: u64,
    pub polling_interval_secs: u64,
    pub join_timeout_secs: u64,
    pub join_max_retries: u32,
}

impl Default for PubSubSection {
    fn default() -> Self {
        let defaults = PubSubConfig::default();
        PubSubSection {
            batch_size: defaults.batch_size,
            batch_time_ms: defaults.batch_time.as_millis() as u64,
            polling_interval_secs: defaults.polling_interval.as_secs(),
            join_timeout_secs: defaults.join_timeout.as_secs(),
            join_max_retries: defaults.join_max_retries,
        }
    }
}

impl PubSubSection {
    pub fn to_config(&self) -> PubSubConfig {
        PubSubConfig {
            batch_size: self.batch_size,
            batch_time: Duration::from_millis(self.batch_time_ms),
            polling_interval: Duration::from_secs(self.polling_interval_secs),
            join_timeout: Duration::from_secs(self.join_timeout_secs),
            join_max_retries: self.join_max_retries,
        }
    }
}

impl NodeConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: NodeConfig =
            toml::from_str(&text).with_context(|| format!("parsing config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.dht.to_config().validate()?;
        if self.mesh.max_message_bytes == 0 {
            anyhow::bail!("mesh.max_message_bytes must be positive");
        }
        if self.pubsub.batch_size == 0 {
            anyhow::bail!("pubsub.batch_size must be positive");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_defaults() {
        let config: NodeConfig = toml::from_str("").unwrap();
        config.validate().unwrap();
        assert_eq!(config.dht.k, 20);
        assert_eq!(config.dht.alpha, 3);
        assert_eq!(config.pubsub.batch_size, 10);
        assert_eq!(
            config.node.bootstrap_url.as_deref(),
            Some("ws://127.0.0.1:8080")
        );
    }

    #[test]
    fn sections_override_individually() {
        let config: NodeConfig = toml::from_str(
            r#"
            [node]
            bootstrap_url = "ws://bootstrap.example:4444"

            [dht]
            k = 16

            [pubsub]
            batch_size = 4
            "#,
        )
        .unwrap();
        assert_eq!(config.dht.k, 16);
        assert_eq!(config.dht.alpha, 3);
        assert_eq!(config.pubsub.batch_size, 4);
        assert_eq!(
            config.node.bootstrap_url.as_deref(),
            Some("ws://bootstrap.example:4444")
        );
    }

    #[test]
    fn invalid_values_are_rejected() {
        let config: NodeConfig = toml::from_str("[dht]\nk = 0\n").unwrap();
        assert!(config.validate().is_err());

        let config: NodeConfig = toml::from_str("[pubsub]\nbatch_size = 0\n").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(toml::from_str::<NodeConfig>("[dht]\nmystery = 1\n").is_err());
    }
}
