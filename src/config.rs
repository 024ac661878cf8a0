//! Server configuration
//!
//! Loaded from a JSON file, with the cluster node name overridable from the
//! process environment (`HOSTNAME`) for container orchestration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Topic sizing and behavior limits, threaded through the server context.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Limits {
    /// Seconds an idle master topic stays loaded with no attached sessions.
    pub idle_master_topic_timeout: u64,
    /// Maximum number of subscribers per group topic.
    pub max_subscriber_count: usize,
    /// Maximum size of a message payload in bytes.
    pub max_message_size: usize,
    /// Maximum number of messages one `{del}` may target.
    pub default_max_delete_count: u64,
    /// Tag namespaces only root may mutate.
    pub restricted_tag_ns: Vec<String>,
    /// Tag namespaces hidden from search.
    pub masked_tag_ns: Vec<String>,
    /// Milliseconds to debounce user-agent announcements on `me`.
    pub ua_timer_delay_ms: u64,
    /// Milliseconds between deferred presence flushes.
    pub deferred_notif_interval_ms: u64,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            idle_master_topic_timeout: 4,
            max_subscriber_count: 128,
            max_message_size: 131072,
            default_max_delete_count: 1024,
            restricted_tag_ns: vec!["email".into(), "tel".into()],
            masked_tag_ns: vec![],
            ua_timer_delay_ms: 5000,
            deferred_notif_interval_ms: 500,
        }
    }
}

impl Limits {
    pub fn idle_topic_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_master_topic_timeout)
    }

    pub fn ua_timer_delay(&self) -> Duration {
        Duration::from_millis(self.ua_timer_delay_ms)
    }

    pub fn deferred_notif_interval(&self) -> Duration {
        Duration::from_millis(self.deferred_notif_interval_ms)
    }
}

/// Leader-style failover tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FailoverConfig {
    pub enabled: bool,
    /// Milliseconds between heartbeats.
    pub heartbeat: u64,
    /// Leader is voted out after this many missed heartbeats.
    pub vote_after: u32,
    /// A follower is considered down after this many missed heartbeats.
    pub node_fail_after: u32,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            heartbeat: 1000,
            vote_after: 8,
            node_fail_after: 16,
        }
    }
}

/// Cluster membership.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Name of this node. Overridable via `HOSTNAME`.
    #[serde(rename = "self")]
    pub self_name: String,
    pub nodes: Vec<String>,
    pub failover: Option<FailoverConfig>,
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub limits: Limits,
    pub cluster: Option<ClusterConfig>,
    /// Adapter-specific sections, passed through opaque.
    pub store: Option<Value>,
    pub push: Option<Value>,
}

impl Config {
    /// Load and validate configuration from a JSON file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(path.display().to_string(), e))?;
        let mut config: Config = serde_json::from_str(&raw).map_err(ConfigError::Parse)?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Apply process-environment overrides. `HOSTNAME` wins over the
    /// configured node name so the same file works across a stateful set.
    pub fn apply_env(&mut self) {
        if let Some(cluster) = &mut self.cluster
            && let Ok(hostname) = std::env::var("HOSTNAME")
            && !hostname.is_empty()
            && cluster.nodes.iter().any(|n| *n == hostname)
        {
            cluster.self_name = hostname;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(cluster) = &self.cluster {
            if cluster.self_name.is_empty() {
                return Err(ConfigError::Invalid("cluster.self is not set"));
            }
            if !cluster.nodes.iter().any(|n| *n == cluster.self_name) {
                return Err(ConfigError::Invalid("cluster.self is not listed in cluster.nodes"));
            }
            if let Some(failover) = &cluster.failover
                && failover.enabled
                && cluster.nodes.len() < 3
            {
                return Err(ConfigError::Invalid("failover requires at least 3 nodes"));
            }
        }
        if self.limits.max_subscriber_count == 0 {
            return Err(ConfigError::Invalid("max_subscriber_count must be positive"));
        }
        Ok(())
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config {0}: {1}")]
    Io(String, std::io::Error),
    #[error("cannot parse config: {0}")]
    Parse(serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.limits.max_subscriber_count, 128);
        assert_eq!(config.limits.idle_topic_timeout(), Duration::from_secs(4));
        assert!(config.cluster.is_none());
    }

    #[test]
    fn test_parse_cluster() {
        let json = r#"{
            "limits": {"max_subscriber_count": 16},
            "cluster": {"self": "n1", "nodes": ["n1", "n2", "n3"],
                        "failover": {"enabled": true}}
        }"#;
        let mut config: Config = serde_json::from_str(json).unwrap();
        config.validate().unwrap();
        assert_eq!(config.limits.max_subscriber_count, 16);
        let cluster = config.cluster.unwrap();
        assert_eq!(cluster.self_name, "n1");
        assert_eq!(cluster.failover.unwrap().vote_after, 8);
    }

    #[test]
    fn test_failover_needs_three_nodes() {
        let json = r#"{
            "cluster": {"self": "n1", "nodes": ["n1", "n2"],
                        "failover": {"enabled": true}}
        }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_self_must_be_a_node() {
        let json = r#"{"cluster": {"self": "nx", "nodes": ["n1", "n2"]}}"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert!(config.validate().is_err());
    }
}
