//! ---
//! hsp_section: "01-core-functionality"
//! hsp_subsection: "module"
//! hsp_type: "source"
//! hsp_scope: "code"
//! hsp_description: "Shared primitives and utilities for the bridge runtime."
//! hsp_version: "v0.0.0-prealpha"
//! hsp_owner: "tbd"
//! ---
use std::collections::HashSet;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds, DurationSeconds};
use tracing::debug;
use url::Url;

use crate::logging::LogFormat;

fn default_node_id() -> String {
    "hsp-node".to_owned()
}

fn default_namespace() -> String {
    "hsp".to_owned()
}

fn default_connect_attempts() -> u32 {
    3
}

fn default_broker_host() -> String {
    "localhost".to_owned()
}

fn default_broker_port() -> u16 {
    1883
}

fn default_keep_alive() -> Duration {
    Duration::from_secs(30)
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_reconnect_base() -> Duration {
    Duration::from_millis(500)
}

fn default_reconnect_max() -> Duration {
    Duration::from_secs(30)
}

fn default_reconnect_exponent() -> u32 {
    6
}

fn default_reconnect_jitter() -> Duration {
    Duration::from_millis(250)
}

fn default_ack_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_max_ack_retries() -> u32 {
    3
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_initial_delay() -> Duration {
    Duration::from_millis(1000)
}

fn default_backoff_factor() -> f64 {
    2.0
}

fn default_retry_max_delay() -> Duration {
    Duration::from_secs(60)
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_recovery_timeout() -> Duration {
    Duration::from_secs(300)
}

fn default_true() -> bool {
    true
}

fn default_health_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_fallback_retries() -> u32 {
    3
}

fn default_fallback_retry_delay() -> Duration {
    Duration::from_millis(1000)
}

fn default_message_ttl() -> Duration {
    Duration::from_secs(3600)
}

fn default_memory_priority() -> u8 {
    1
}

fn default_file_priority() -> u8 {
    2
}

fn default_http_priority() -> u8 {
    3
}

fn default_file_base_path() -> PathBuf {
    PathBuf::from("data/fallback_comm")
}

fn default_poll_interval() -> Duration {
    Duration::from_millis(500)
}

fn default_http_host() -> String {
    "127.0.0.1".to_owned()
}

fn default_http_port() -> u16 {
    8765
}

fn default_http_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_log_format() -> LogFormat {
    LogFormat::StructuredJson
}

fn default_metrics_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 9898))
}

/// Primary configuration object for a bridge node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Identifier this node uses as `sender_id` and mailbox name.
    #[serde(default = "default_node_id")]
    pub node_id: String,
    /// Leading segment of every wire topic.
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: u32,
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub ack: AckConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    #[serde(default)]
    pub fallback: FallbackConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Metadata describing where a [`BridgeConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedBridgeConfig {
    pub config: BridgeConfig,
    pub source: PathBuf,
}

impl BridgeConfig {
    pub const ENV_CONFIG_PATH: &'static str = "HSP_BRIDGE_CONFIG";

    /// Load configuration from disk, respecting the `HSP_BRIDGE_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load configuration from disk together with the effective source path.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedBridgeConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(&path)?;
                return Ok(LoadedBridgeConfig {
                    config,
                    source: path,
                });
            }
        }

        for candidate in candidates {
            if candidate.as_ref().exists() {
                let path = candidate.as_ref().to_path_buf();
                let config = Self::from_path(&path)?;
                return Ok(LoadedBridgeConfig {
                    config,
                    source: path,
                });
            }
        }

        Err(anyhow!(
            "no configuration files found. inspected: {}",
            candidates
                .iter()
                .map(|p| p.as_ref().display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ))
    }

    /// Read and validate a single configuration file.
    pub fn from_path(path: &Path) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        let config = toml::from_str::<BridgeConfig>(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Client identifier presented to the broker.
    pub fn client_id(&self) -> &str {
        self.broker.client_id.as_deref().unwrap_or(&self.node_id)
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<()> {
        if self.node_id.trim().is_empty() {
            return Err(anyhow!("node_id must not be empty"));
        }
        if self.namespace.trim().is_empty() || self.namespace.contains(['#', '+']) {
            return Err(anyhow!(
                "namespace '{}' must be a non-empty literal topic segment",
                self.namespace
            ));
        }
        if self.broker.keep_alive < Duration::from_secs(5) {
            return Err(anyhow!("broker.keep_alive_secs must be at least 5"));
        }
        if self.connect_attempts == 0 {
            return Err(anyhow!("connect_attempts must be at least 1"));
        }
        if self.ack.max_ack_retries == 0 {
            return Err(anyhow!("ack.max_ack_retries must be at least 1"));
        }
        self.retry.validate()?;
        if self.circuit_breaker.failure_threshold == 0 {
            return Err(anyhow!("circuit_breaker.failure_threshold must be positive"));
        }
        self.fallback.validate()?;
        Ok(())
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            namespace: default_namespace(),
            connect_attempts: default_connect_attempts(),
            broker: BrokerConfig::default(),
            ack: AckConfig::default(),
            retry: RetryConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            fallback: FallbackConfig::default(),
            logging: LoggingConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl std::str::FromStr for BridgeConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: BridgeConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    #[serde(default = "default_broker_host")]
    pub host: String,
    #[serde(default = "default_broker_port")]
    pub port: u16,
    /// Defaults to the node id when unset.
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default = "default_keep_alive", rename = "keep_alive_secs")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub keep_alive: Duration,
    #[serde(default = "default_connect_timeout", rename = "connect_timeout_secs")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub connect_timeout: Duration,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: default_broker_host(),
            port: default_broker_port(),
            client_id: None,
            keep_alive: default_keep_alive(),
            connect_timeout: default_connect_timeout(),
            reconnect: ReconnectConfig::default(),
        }
    }
}

/// Backoff applied by the transport adapter after an unexpected disconnect.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    #[serde(default = "default_reconnect_base", rename = "base_delay_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub base_delay: Duration,
    #[serde(default = "default_reconnect_max", rename = "max_delay_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub max_delay: Duration,
    #[serde(default = "default_reconnect_exponent")]
    pub max_exponent: u32,
    #[serde(default = "default_reconnect_jitter", rename = "jitter_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub jitter: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay: default_reconnect_base(),
            max_delay: default_reconnect_max(),
            max_exponent: default_reconnect_exponent(),
            jitter: default_reconnect_jitter(),
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AckConfig {
    #[serde(default = "default_ack_timeout", rename = "ack_timeout_seconds")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub ack_timeout: Duration,
    #[serde(default = "default_max_ack_retries")]
    pub max_ack_retries: u32,
}

impl Default for AckConfig {
    fn default() -> Self {
        Self {
            ack_timeout: default_ack_timeout(),
            max_ack_retries: default_max_ack_retries(),
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_retry_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_initial_delay", rename = "initial_delay_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub initial_delay: Duration,
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
    #[serde(default = "default_retry_max_delay", rename = "max_delay_seconds")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub max_delay: Duration,
}

impl RetryConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(anyhow!("retry.max_attempts must be at least 1"));
        }
        if !self.backoff_factor.is_finite() || self.backoff_factor < 1.0 {
            return Err(anyhow!(
                "retry.backoff_factor must be a finite value >= 1.0 (got {})",
                self.backoff_factor
            ));
        }
        Ok(())
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_retry_attempts(),
            initial_delay: default_retry_initial_delay(),
            backoff_factor: default_backoff_factor(),
            max_delay: default_retry_max_delay(),
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_recovery_timeout", rename = "recovery_timeout_seconds")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub recovery_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            recovery_timeout: default_recovery_timeout(),
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FallbackConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(
        default = "default_health_interval",
        rename = "health_check_interval_seconds"
    )]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub health_check_interval: Duration,
    #[serde(default = "default_fallback_retries")]
    pub max_retries: u32,
    #[serde(default = "default_fallback_retry_delay", rename = "retry_delay_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub retry_delay: Duration,
    /// Lifetime stamped on every outgoing fallback message.
    #[serde(default = "default_message_ttl", rename = "message_ttl_seconds")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub message_ttl: Duration,
    #[serde(default)]
    pub memory: MemoryProtocolConfig,
    #[serde(default)]
    pub file: FileProtocolConfig,
    #[serde(default)]
    pub http: HttpProtocolConfig,
}

impl FallbackConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        if self.max_retries == 0 {
            return Err(anyhow!("fallback.max_retries must be at least 1"));
        }
        let mut seen = HashSet::new();
        let enabled = [
            ("memory", self.memory.enabled, self.memory.priority),
            ("file", self.file.enabled, self.file.priority),
            ("http", self.http.enabled, self.http.priority),
        ];
        for (name, on, priority) in enabled {
            if on && !seen.insert(priority) {
                return Err(anyhow!(
                    "fallback protocol '{}' reuses priority {}",
                    name,
                    priority
                ));
            }
        }
        Ok(())
    }
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            health_check_interval: default_health_interval(),
            max_retries: default_fallback_retries(),
            retry_delay: default_fallback_retry_delay(),
            message_ttl: default_message_ttl(),
            memory: MemoryProtocolConfig::default(),
            file: FileProtocolConfig::default(),
            http: HttpProtocolConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryProtocolConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_memory_priority")]
    pub priority: u8,
}

impl Default for MemoryProtocolConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            priority: default_memory_priority(),
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileProtocolConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_file_priority")]
    pub priority: u8,
    #[serde(default = "default_file_base_path")]
    pub base_path: PathBuf,
    #[serde(default = "default_poll_interval", rename = "poll_interval_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub poll_interval: Duration,
}

impl Default for FileProtocolConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            priority: default_file_priority(),
            base_path: default_file_base_path(),
            poll_interval: default_poll_interval(),
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpProtocolConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_http_priority")]
    pub priority: u8,
    #[serde(default = "default_http_host")]
    pub host: String,
    #[serde(default = "default_http_port")]
    pub port: u16,
    #[serde(default = "default_http_timeout", rename = "request_timeout_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub request_timeout: Duration,
    /// Known peers keyed by node id.
    #[serde(default)]
    pub peers: IndexMap<String, Url>,
}

impl Default for HttpProtocolConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            priority: default_http_priority(),
            host: default_http_host(),
            port: default_http_port(),
            request_timeout: default_http_timeout(),
            peers: IndexMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Directory for the rolling JSON log; stdout only when unset.
    #[serde(default)]
    pub directory: Option<PathBuf>,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    #[serde(default)]
    pub file_prefix: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: None,
            format: default_log_format(),
            file_prefix: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_metrics_listen")]
    pub listen: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen: default_metrics_listen(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn empty_document_yields_defaults() {
        let config = BridgeConfig::from_str("").expect("defaults validate");
        assert_eq!(config.node_id, "hsp-node");
        assert_eq!(config.connect_attempts, 3);
        assert_eq!(config.ack.ack_timeout, Duration::from_secs(10));
        assert_eq!(config.ack.max_ack_retries, 3);
        assert_eq!(config.retry.max_delay, Duration::from_secs(60));
        assert_eq!(config.circuit_breaker.failure_threshold, 5);
        assert_eq!(
            config.circuit_breaker.recovery_timeout,
            Duration::from_secs(300)
        );
        assert_eq!(config.fallback.http.port, 8765);
        assert_eq!(config.client_id(), "hsp-node");
    }

    #[test]
    fn parses_sections_and_peers() {
        let doc = r#"
            node_id = "planner"
            namespace = "lab"

            [broker]
            host = "broker.internal"
            port = 8883
            client_id = "planner-1"

            [broker.reconnect]
            base_delay_ms = 100
            max_delay_ms = 2000

            [ack]
            ack_timeout_seconds = 2
            max_ack_retries = 1

            [circuit_breaker]
            failure_threshold = 2
            recovery_timeout_seconds = 15

            [fallback]
            health_check_interval_seconds = 5

            [fallback.file]
            base_path = "/var/lib/hsp"

            [fallback.http]
            port = 9000
            peers = { executor = "http://10.0.0.5:9000/" }
        "#;
        let config = BridgeConfig::from_str(doc).expect("valid config");
        assert_eq!(config.namespace, "lab");
        assert_eq!(config.client_id(), "planner-1");
        assert_eq!(config.broker.reconnect.base_delay, Duration::from_millis(100));
        assert_eq!(config.ack.ack_timeout, Duration::from_secs(2));
        assert_eq!(config.circuit_breaker.failure_threshold, 2);
        assert_eq!(config.fallback.health_check_interval, Duration::from_secs(5));
        assert_eq!(config.fallback.file.base_path, PathBuf::from("/var/lib/hsp"));
        assert_eq!(
            config.fallback.http.peers["executor"].as_str(),
            "http://10.0.0.5:9000/"
        );
    }

    #[test]
    fn rejects_duplicate_priorities() {
        let doc = r#"
            [fallback.file]
            priority = 1
        "#;
        let err = BridgeConfig::from_str(doc).unwrap_err();
        assert!(err.to_string().contains("reuses priority"));
    }

    #[test]
    fn duplicate_priority_ignored_when_protocol_disabled() {
        let doc = r#"
            [fallback.file]
            enabled = false
            priority = 1
        "#;
        assert!(BridgeConfig::from_str(doc).is_ok());
    }

    #[test]
    fn rejects_zero_connect_attempts_and_blank_node() {
        assert!(BridgeConfig::from_str("connect_attempts = 0").is_err());
        assert!(BridgeConfig::from_str("node_id = \"  \"").is_err());
        assert!(BridgeConfig::from_str("namespace = \"a/#\"").is_err());
    }

    #[test]
    fn rejects_shrinking_backoff() {
        let doc = r#"
            [retry]
            backoff_factor = 0.5
        "#;
        assert!(BridgeConfig::from_str(doc).is_err());
    }

    #[test]
    fn load_picks_first_existing_candidate() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.toml");
        let present = dir.path().join("bridge.toml");
        fs::write(&present, "node_id = \"from-file\"").unwrap();
        let loaded = BridgeConfig::load_with_source(&[&missing, &present]).unwrap();
        assert_eq!(loaded.source, present);
        assert_eq!(loaded.config.node_id, "from-file");
    }

    #[test]
    fn load_reports_inspected_candidates() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nothing.toml");
        let err = BridgeConfig::load(&[&missing]).unwrap_err();
        assert!(err.to_string().contains("nothing.toml"));
    }
}
