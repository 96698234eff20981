//! Runtime configuration for a `kiq` node.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Redis connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Redis URL, e.g. `redis://localhost:6379`.
    #[serde(default = "default_redis_url")]
    pub url: String,

    /// Connection pool size.
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// Connection timeout in seconds.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            pool_size: default_pool_size(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_pool_size() -> usize {
    10
}

fn default_connect_timeout() -> u64 {
    5
}

impl RedisConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// A queue name and its worker concurrency cap.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    pub name: String,
    pub concurrency: usize,
}

impl QueueConfig {
    pub fn new(name: impl Into<String>, concurrency: usize) -> Self {
        Self {
            name: name.into(),
            concurrency,
        }
    }
}

fn default_queues() -> Vec<QueueConfig> {
    vec![QueueConfig::new("default", 10)]
}

fn default_scheduler_sets() -> Vec<String> {
    vec!["schedule".to_string(), "retry".to_string()]
}

fn default_scheduler_poll_interval_secs() -> f64 {
    1.0
}

fn default_shutdown_grace_secs() -> u64 {
    30
}

fn default_node_id() -> String {
    let host = hostname();
    let pid = std::process::id();
    let suffix = hex::encode(rand::random::<[u8; 4]>());
    format!("{}:{}:{}", host, pid, suffix)
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

fn default_true() -> bool {
    true
}

/// The configuration a host provides at Supervisor construction time
/// (§6 "Configuration"). Loadable from env/files via `config`/`dotenvy`
/// when running the `kiq-worker` binary; embedding hosts may also build
/// this directly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KiqConfig {
    #[serde(default)]
    pub redis: RedisConfig,

    /// Queues this node processes, each with its own concurrency cap.
    #[serde(default = "default_queues")]
    pub queues: Vec<QueueConfig>,

    /// Sorted-set names polled by the schedulers.
    #[serde(default = "default_scheduler_sets")]
    pub scheduler_sets: Vec<String>,

    /// Base scheduler tick interval in seconds (jittered ±50% at runtime).
    #[serde(default = "default_scheduler_poll_interval_secs")]
    pub scheduler_poll_interval_secs: f64,

    /// Grace period for in-flight jobs to finish during shutdown.
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,

    /// Identifies this node's backup lists (`queue:<name>:<node_id>`).
    #[serde(default = "default_node_id")]
    pub node_id: String,

    /// When false, only the Embedding API is available: no pipelines,
    /// reporter chain, or schedulers are started.
    #[serde(default = "default_true")]
    pub server: bool,
}

impl Default for KiqConfig {
    fn default() -> Self {
        Self {
            redis: RedisConfig::default(),
            queues: default_queues(),
            scheduler_sets: default_scheduler_sets(),
            scheduler_poll_interval_secs: default_scheduler_poll_interval_secs(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
            node_id: default_node_id(),
            server: true,
        }
    }
}

impl KiqConfig {
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_one_default_queue() {
        let config = KiqConfig::default();
        assert_eq!(config.queues.len(), 1);
        assert_eq!(config.queues[0].name, "default");
        assert_eq!(config.scheduler_sets, vec!["schedule", "retry"]);
        assert!(config.server);
    }

    #[test]
    fn node_ids_are_not_trivially_repeated() {
        assert_ne!(default_node_id(), default_node_id());
    }
}
