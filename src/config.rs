use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::QueueId;

/// Top-level configuration shared by every role.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,

    /// Agent role configuration.
    #[serde(default)]
    pub agent: AgentConfig,

    /// Coordinator role configuration.
    #[serde(default)]
    pub coordinator: CoordinatorConfig,

    /// Collector role configuration.
    #[serde(default)]
    pub collector: CollectorConfig,
}

/// Agent role configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Hostname other agents and the coordinator use to reach this agent.
    /// Default: "localhost".
    #[serde(default = "default_hostname")]
    pub hostname: String,

    /// Port for remote triggers from the coordinator. Default: 5050.
    #[serde(default = "default_agent_port")]
    pub port: u16,

    /// Coordinator address as "host:port".
    #[serde(default)]
    pub coordinator_addr: String,

    /// Collector address as "host:port". Empty disables reporting; reported
    /// buffers are recycled immediately.
    #[serde(default)]
    pub reporting_addr: String,

    /// Delay applied to local triggers before processing. Default: 0s.
    #[serde(default, with = "humantime_serde")]
    pub trigger_delay: Duration,

    /// Global reporting bandwidth in MB/s. 0 means unlimited. Default: 0.
    #[serde(default)]
    pub reporting_rate_limit_mb: f64,

    /// Local triggers per second per queue. 0 means unlimited. Default: 10000.
    #[serde(default = "default_trigger_rate_limit")]
    pub trigger_rate_limit: f64,

    /// Per-queue reporting bandwidth in MB/s.
    #[serde(default)]
    pub queue_reporting_limits_mb: HashMap<QueueId, f64>,

    /// Maximum number of live trigger queues. 0 means unbounded. Default: 0.
    #[serde(default)]
    pub max_trigger_queues: usize,

    /// Idle fired triggers are removed after this long. Default: 5m.
    #[serde(default = "default_idle_trigger_timeout", with = "humantime_serde")]
    pub idle_trigger_timeout: Duration,

    /// How often to check for data to report when idle. Default: 100ms.
    #[serde(default = "default_report_interval", with = "humantime_serde")]
    pub report_interval: Duration,

    /// Telemetry snapshot interval. Default: 1s.
    #[serde(default = "default_stats_interval", with = "humantime_serde")]
    pub stats_interval: Duration,

    /// Log every telemetry snapshot at info level. Default: false.
    #[serde(default)]
    pub verbose_stats: bool,

    /// Buffer pool configuration.
    #[serde(default)]
    pub buffers: BufferPoolConfig,
}

/// In-process buffer pool configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct BufferPoolConfig {
    /// Number of buffers. Default: 16384.
    #[serde(default = "default_buffer_capacity")]
    pub capacity: usize,

    /// Size of each buffer in bytes. Default: 32768.
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    /// Depth of each producer-to-agent batch channel. Default: 100000.
    #[serde(default = "default_channel_size")]
    pub channel_size: usize,
}

/// Coordinator role configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CoordinatorConfig {
    /// Listen port. Default: 5252.
    #[serde(default = "default_coordinator_port")]
    pub port: u16,

    /// Traces and triggers untouched for this long are forgotten. Default: 60s.
    #[serde(default = "default_expiry_timeout", with = "humantime_serde")]
    pub expiry_timeout: Duration,

    /// Background expiration sweep interval. Default: 1s.
    #[serde(default = "default_sweep_interval", with = "humantime_serde")]
    pub sweep_interval: Duration,

    /// CSV file receiving one row per expired trigger. Empty disables it.
    #[serde(default)]
    pub log_file: Option<PathBuf>,
}

/// Collector role configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CollectorConfig {
    /// Listen port. Default: 5253.
    #[serde(default = "default_collector_port")]
    pub port: u16,

    /// File receiving reported buffers. Empty means count only.
    #[serde(default)]
    pub output: Option<PathBuf>,
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Listen address. Default: ":9090".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_hostname() -> String {
    "localhost".to_string()
}

fn default_agent_port() -> u16 {
    5050
}

fn default_trigger_rate_limit() -> f64 {
    10_000.0
}

fn default_idle_trigger_timeout() -> Duration {
    Duration::from_secs(300)
}

fn default_report_interval() -> Duration {
    Duration::from_millis(100)
}

fn default_stats_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_buffer_capacity() -> usize {
    16_384
}

fn default_buffer_size() -> usize {
    32 * 1024
}

fn default_channel_size() -> usize {
    100_000
}

fn default_coordinator_port() -> u16 {
    5252
}

fn default_expiry_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_sweep_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_collector_port() -> u16 {
    5253
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            health: HealthConfig::default(),
            agent: AgentConfig::default(),
            coordinator: CoordinatorConfig::default(),
            collector: CollectorConfig::default(),
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            hostname: default_hostname(),
            port: default_agent_port(),
            coordinator_addr: String::new(),
            reporting_addr: String::new(),
            trigger_delay: Duration::ZERO,
            reporting_rate_limit_mb: 0.0,
            trigger_rate_limit: default_trigger_rate_limit(),
            queue_reporting_limits_mb: HashMap::new(),
            max_trigger_queues: 0,
            idle_trigger_timeout: default_idle_trigger_timeout(),
            report_interval: default_report_interval(),
            stats_interval: default_stats_interval(),
            verbose_stats: false,
            buffers: BufferPoolConfig::default(),
        }
    }
}

impl Default for BufferPoolConfig {
    fn default() -> Self {
        Self {
            capacity: default_buffer_capacity(),
            buffer_size: default_buffer_size(),
            channel_size: default_channel_size(),
        }
    }
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            port: default_coordinator_port(),
            expiry_timeout: default_expiry_timeout(),
            sweep_interval: default_sweep_interval(),
            log_file: None,
        }
    }
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            port: default_collector_port(),
            output: None,
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            addr: default_health_addr(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate settings common to every role.
    pub fn validate(&self) -> Result<()> {
        if self.health.addr.is_empty() {
            bail!("health.addr is required");
        }

        Ok(())
    }

    /// Validate settings required to run an agent.
    pub fn validate_agent(&self) -> Result<()> {
        let agent = &self.agent;

        if agent.coordinator_addr.is_empty() {
            bail!("agent.coordinator_addr is required");
        }

        if agent.hostname.is_empty() {
            bail!("agent.hostname is required");
        }

        if agent.buffers.capacity == 0 {
            bail!("agent.buffers.capacity must be positive");
        }

        if agent.buffers.buffer_size == 0 {
            bail!("agent.buffers.buffer_size must be positive");
        }

        if agent.buffers.channel_size == 0 {
            bail!("agent.buffers.channel_size must be positive");
        }

        if agent.report_interval.is_zero() {
            bail!("agent.report_interval must be positive");
        }

        if agent.stats_interval.is_zero() {
            bail!("agent.stats_interval must be positive");
        }

        if agent.idle_trigger_timeout.is_zero() {
            bail!("agent.idle_trigger_timeout must be positive");
        }

        if agent.reporting_rate_limit_mb < 0.0 {
            bail!("agent.reporting_rate_limit_mb must not be negative");
        }

        if agent.trigger_rate_limit < 0.0 {
            bail!("agent.trigger_rate_limit must not be negative");
        }

        for (queue_id, limit) in &agent.queue_reporting_limits_mb {
            if *limit <= 0.0 {
                bail!("agent.queue_reporting_limits_mb for queue {queue_id} must be positive");
            }
        }

        Ok(())
    }

    /// Validate settings required to run a coordinator.
    pub fn validate_coordinator(&self) -> Result<()> {
        if self.coordinator.expiry_timeout.is_zero() {
            bail!("coordinator.expiry_timeout must be positive");
        }

        if self.coordinator.sweep_interval.is_zero() {
            bail!("coordinator.sweep_interval must be positive");
        }

        Ok(())
    }

    /// Validate settings required to run a collector.
    pub fn validate_collector(&self) -> Result<()> {
        if let Some(output) = &self.collector.output {
            if output.as_os_str().is_empty() {
                bail!("collector.output must not be an empty path");
            }
        }

        Ok(())
    }
}

impl AgentConfig {
    /// Address advertised to peers.
    pub fn advertised_addr(&self) -> String {
        format!("{}:{}", self.hostname, self.port)
    }
}

/// Expands ":port" into a wildcard bind address.
pub fn bind_addr(addr: &str) -> String {
    if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    }
}
