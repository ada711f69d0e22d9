use log::{debug, warn};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{AgentError, Result};
use crate::exporter::EvictionPolicy;
use crate::probe::{ProbeKind, Target};
use crate::retry::RetryConfig;
use crate::scheduler::{CadenceConfig, JitterMode};

/// Environment variable prefix for configuration overrides
pub const ENV_PREFIX: &str = "NETPROBE";

/// Logging level
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Error level
    Error,
    /// Warning level
    Warn,
    /// Info level
    #[default]
    Info,
    /// Debug level
    Debug,
    /// Trace level
    Trace,
}

impl std::str::FromStr for LogLevel {
    type Err = AgentError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "error" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            other => Err(AgentError::config(format!("unknown log level: {}", other))),
        }
    }
}

/// Window clock configuration
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct WindowConfig {
    /// Length of every aggregation window
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
    /// How long after a window ends it stays open for stragglers
    #[serde(with = "humantime_serde")]
    pub grace: Duration,
    /// Skip records for windows without any sample
    pub suppress_empty: bool,
    /// Percentiles reported for every window, in `[0, 100]`
    pub percentiles: Vec<f64>,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            duration: Duration::from_secs(3),
            grace: Duration::from_secs(1),
            suppress_empty: false,
            percentiles: vec![25.0, 50.0, 75.0, 90.0, 99.0],
        }
    }
}

fn default_period() -> Duration {
    Duration::from_secs(1)
}

fn default_jitter() -> f64 {
    0.1
}

fn default_timeout() -> Duration {
    Duration::from_secs(1)
}

fn default_max_bytes() -> u64 {
    25 * 1024 * 1024
}

fn default_transfer_time() -> Duration {
    Duration::from_secs(5)
}

/// One measured endpoint
#[derive(Debug, Deserialize, Clone)]
pub struct TargetConfig {
    /// Unique name, used as the series key
    pub name: String,
    /// Hostname or IP address
    pub host: String,
    /// Which probe measures this target
    pub probe: ProbeKind,
    /// Mean time between measurements
    #[serde(default = "default_period", with = "humantime_serde")]
    pub period: Duration,
    /// Randomisation of the period, as a fraction of it
    #[serde(default = "default_jitter")]
    pub jitter: f64,
    #[serde(default)]
    pub jitter_mode: JitterMode,
    /// Upper bound of a single measurement
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,
    /// Port for TCP connect probes
    #[serde(default)]
    pub port: Option<u16>,
    /// Download URL for throughput probes, upload URL for upload probes
    #[serde(default)]
    pub url: Option<String>,
    /// Stop a throughput transfer after this many bytes
    #[serde(default = "default_max_bytes")]
    pub max_bytes: u64,
    /// Stop a throughput transfer after this long
    #[serde(default = "default_transfer_time", with = "humantime_serde")]
    pub transfer_time: Duration,
}

impl TargetConfig {
    /// Create a target with default cadence settings
    pub fn new(name: impl Into<String>, host: impl Into<String>, probe: ProbeKind) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            probe,
            period: default_period(),
            jitter: default_jitter(),
            jitter_mode: JitterMode::default(),
            timeout: default_timeout(),
            port: None,
            url: None,
            max_bytes: default_max_bytes(),
            transfer_time: default_transfer_time(),
        }
    }

    /// The endpoint handed to probes
    pub fn target(&self) -> Target {
        let url = match self.probe {
            ProbeKind::Throughput | ProbeKind::Upload => Some(
                self.url
                    .clone()
                    .unwrap_or_else(|| format!("https://{}/", self.host)),
            ),
            _ => self.url.clone(),
        };
        Target {
            name: self.name.clone(),
            host: self.host.clone(),
            kind: self.probe,
            port: self.port,
            url,
            max_bytes: self.max_bytes,
            transfer_time: self.transfer_time,
            timeout: self.timeout,
        }
    }

    /// Scheduling parameters for this target
    pub fn cadence(&self) -> CadenceConfig {
        CadenceConfig {
            period: self.period,
            jitter: self.jitter,
            mode: self.jitter_mode,
            timeout: self.timeout,
        }
    }

    fn validate(&self) -> Result<()> {
        let name = &self.name;
        if name.trim().is_empty() {
            return Err(AgentError::config("target name must not be empty"));
        }
        if self.host.trim().is_empty() {
            return Err(AgentError::config(format!("target '{}': host must not be empty", name)));
        }
        if self.period.is_zero() {
            return Err(AgentError::config(format!("target '{}': period must be positive", name)));
        }
        if self.timeout.is_zero() {
            return Err(AgentError::config(format!("target '{}': timeout must be positive", name)));
        }
        if !(0.0..1.0).contains(&self.jitter) {
            return Err(AgentError::config(format!(
                "target '{}': jitter must be in [0, 1), got {}",
                name, self.jitter
            )));
        }
        match self.probe {
            ProbeKind::Tcp if self.port.is_none() => {
                return Err(AgentError::config(format!(
                    "target '{}': tcp probes need a port",
                    name
                )));
            }
            ProbeKind::Throughput | ProbeKind::Upload => {
                let target = self.target();
                let url = target.url.as_deref().unwrap_or_default();
                check_http_url(url).map_err(|e| {
                    AgentError::config(format!("target '{}': {}", name, e))
                })?;
                if self.max_bytes == 0 || self.transfer_time.is_zero() {
                    return Err(AgentError::config(format!(
                        "target '{}': max_bytes and transfer_time must be positive",
                        name
                    )));
                }
                if self.transfer_time >= self.timeout {
                    return Err(AgentError::config(format!(
                        "target '{}': transfer_time must be shorter than timeout",
                        name
                    )));
                }
            }
            #[cfg(not(feature = "icmp"))]
            ProbeKind::Ping => {
                return Err(AgentError::config(format!(
                    "target '{}': built without the icmp feature",
                    name
                )));
            }
            _ => {}
        }
        Ok(())
    }
}

/// Sink backend
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SinkKind {
    /// Elasticsearch-compatible bulk endpoint
    #[default]
    Elastic,
    /// Keep records in memory (dry runs and tests)
    Memory,
}

/// Sink configuration
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SinkConfig {
    pub kind: SinkKind,
    /// Base URL of the indexing endpoint
    pub url: String,
    /// Index the window documents are written to
    pub index: String,
    /// Maximum records per bulk request
    pub batch_size: usize,
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            kind: SinkKind::Elastic,
            url: "http://localhost:9200".to_string(),
            index: "netprobe".to_string(),
            batch_size: 100,
            request_timeout: Duration::from_secs(10),
        }
    }
}

/// Delivery queue configuration
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct QueueConfig {
    pub capacity: usize,
    pub eviction: EvictionPolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 1024,
            eviction: EvictionPolicy::DropOldest,
        }
    }
}

/// Shutdown bounds
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ShutdownConfig {
    /// How long in-flight probes may keep running after the stop signal
    #[serde(with = "humantime_serde")]
    pub grace: Duration,
    /// Upper bound for the whole drain
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            grace: Duration::from_secs(5),
            timeout: Duration::from_secs(15),
        }
    }
}

/// Complete agent configuration
#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub log_level: LogLevel,
    #[serde(default)]
    pub window: WindowConfig,
    #[serde(default)]
    pub targets: Vec<TargetConfig>,
    #[serde(default)]
    pub sink: SinkConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub delivery: RetryConfig,
    #[serde(default)]
    pub shutdown: ShutdownConfig,
}

impl AppConfig {
    /// Check every rule that must hold before the pipeline starts
    pub fn validate(&self) -> Result<()> {
        let window = &self.window;
        if window.duration < Duration::from_millis(100) {
            return Err(AgentError::config("window.duration must be at least 100ms"));
        }
        if window.duration.subsec_nanos() % 1_000_000 != 0 {
            return Err(AgentError::config(
                "window.duration must be a whole number of milliseconds",
            ));
        }
        if window.grace >= window.duration {
            return Err(AgentError::config(
                "window.grace must be shorter than window.duration",
            ));
        }
        if let Some(p) = window
            .percentiles
            .iter()
            .find(|p| !(0.0..=100.0).contains(*p))
        {
            return Err(AgentError::config(format!(
                "window.percentiles must be in [0, 100], got {}",
                p
            )));
        }

        if self.targets.is_empty() {
            return Err(AgentError::config("at least one target must be configured"));
        }
        let mut names = HashSet::new();
        for target in &self.targets {
            target.validate()?;
            if !names.insert(target.name.as_str()) {
                return Err(AgentError::config(format!(
                    "duplicate target name '{}'",
                    target.name
                )));
            }
            if target.timeout > window.grace {
                warn!(
                    "Target '{}' timeout {:?} exceeds window grace {:?}; slow samples may arrive late",
                    target.name, target.timeout, window.grace
                );
            }
        }

        if self.sink.kind == SinkKind::Elastic {
            check_http_url(&self.sink.url)
                .map_err(|e| AgentError::config(format!("sink.url: {}", e)))?;
            if self.sink.index.trim().is_empty() {
                return Err(AgentError::config("sink.index must not be empty"));
            }
        }
        if self.sink.batch_size == 0 {
            return Err(AgentError::config("sink.batch_size must be positive"));
        }
        if self.queue.capacity == 0 {
            return Err(AgentError::config("queue.capacity must be positive"));
        }
        self.delivery.validate()?;
        if self.shutdown.timeout < self.shutdown.grace {
            return Err(AgentError::config(
                "shutdown.timeout must not be shorter than shutdown.grace",
            ));
        }
        Ok(())
    }
}

fn check_http_url(url: &str) -> std::result::Result<(), String> {
    let parsed = reqwest::Url::parse(url).map_err(|e| format!("invalid URL '{}': {}", url, e))?;
    match parsed.scheme() {
        "http" | "https" => Ok(()),
        other => Err(format!("unsupported URL scheme '{}' in '{}'", other, url)),
    }
}

/// Source of configuration
#[derive(Debug, Clone)]
pub enum ConfigSource {
    /// File path (format picked by extension)
    File(PathBuf),
    /// Environment variables with a prefix
    Environment(String),
    /// TOML string
    Toml(String),
    /// Single key override, e.g. from a command-line flag
    Override(String, String),
}

/// Layered configuration builder; later sources override earlier ones
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    sources: Vec<ConfigSource>,
}

impl ConfigBuilder {
    /// Create a new config builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a configuration file source
    pub fn add_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.sources.push(ConfigSource::File(path.as_ref().to_path_buf()));
        self
    }

    /// Add environment variables
    pub fn add_env(mut self, prefix: impl Into<String>) -> Self {
        self.sources.push(ConfigSource::Environment(prefix.into()));
        self
    }

    /// Add TOML string
    pub fn add_toml(mut self, toml: impl Into<String>) -> Self {
        self.sources.push(ConfigSource::Toml(toml.into()));
        self
    }

    /// Override a single key
    pub fn set(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.sources.push(ConfigSource::Override(key.into(), value.into()));
        self
    }

    /// Load the configuration without validating it
    pub fn load(self) -> Result<AppConfig> {
        load_config(self.sources)
    }

    /// Load and validate the configuration
    pub fn build(self) -> Result<AppConfig> {
        let config = self.load()?;
        config.validate()?;
        Ok(config)
    }
}

fn file_format(path: &Path) -> Result<config::FileFormat> {
    let extension = match path.extension() {
        Some(ext) => ext.to_string_lossy().to_lowercase(),
        None => {
            return Err(AgentError::config(format!(
                "Configuration file has no extension: {}",
                path.display()
            )));
        }
    };

    match extension.as_str() {
        "toml" => Ok(config::FileFormat::Toml),
        "json" => Ok(config::FileFormat::Json),
        "yaml" | "yml" => Ok(config::FileFormat::Yaml),
        format => Err(AgentError::config(format!(
            "Unsupported config format: {}",
            format
        ))),
    }
}

/// Load configuration from the given sources, without validating it
pub fn load_config(sources: Vec<ConfigSource>) -> Result<AppConfig> {
    let mut builder = config::Config::builder();

    for source in sources {
        match source {
            ConfigSource::File(path) => {
                if !path.exists() {
                    return Err(AgentError::config(format!(
                        "Configuration file not found: {}",
                        path.display()
                    )));
                }
                debug!("Loading configuration from file: {}", path.display());
                let format = file_format(&path)?;
                builder = builder.add_source(config::File::from(path).format(format));
            }
            ConfigSource::Environment(prefix) => {
                debug!("Loading configuration from environment with prefix: {}", prefix);
                builder = builder.add_source(
                    config::Environment::with_prefix(&prefix)
                        .prefix_separator("__")
                        .separator("__")
                        .try_parsing(true),
                );
            }
            ConfigSource::Toml(toml_str) => {
                debug!("Loading configuration from TOML string");
                builder = builder
                    .add_source(config::File::from_str(&toml_str, config::FileFormat::Toml));
            }
            ConfigSource::Override(key, value) => {
                debug!("Overriding configuration key {}", key);
                builder = builder.set_override(key, value)?;
            }
        }
    }

    let config = builder
        .build()
        .map_err(|e| AgentError::config(format!("Failed to build configuration: {}", e)))?;

    let result: AppConfig = config
        .try_deserialize()
        .map_err(|e| AgentError::config(format!("Failed to deserialize configuration: {}", e)))?;

    debug!("Configuration loaded: {} target(s)", result.targets.len());

    Ok(result)
}
