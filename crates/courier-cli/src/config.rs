//! Configuration system for the Courier CLI.

use courier_core::{
    ArqPolicy, CoverTrafficConfig, CoverTrafficDistribution, DEFAULT_BLOCK_PAYLOAD, LoopbackConfig,
    ServiceAddress, SessionConfig,
};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Courier configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Local session
    #[serde(default)]
    pub session: SessionSection,
    /// Retransmission policy
    #[serde(default)]
    pub arq: ArqPolicy,
    /// Loopback simulation
    #[serde(default)]
    pub simulation: SimulationConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSection {
    /// Local user name
    #[serde(default = "default_user")]
    pub user: String,
    /// Local provider
    #[serde(default = "default_provider")]
    pub provider: String,
    /// Plaintext bytes per block
    #[serde(default = "default_block_payload_len")]
    pub block_payload_len: usize,
    /// Provider connection timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Loop decoy destination (`user@provider`)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub loop_service: Option<String>,
    /// Enable periodic loop decoys
    #[serde(default)]
    pub cover_traffic: bool,
    /// Mean interval between decoys in milliseconds
    #[serde(default = "default_cover_interval")]
    pub cover_interval_ms: u64,
    /// Decoy interval distribution
    #[serde(default = "default_cover_distribution")]
    pub cover_distribution: CoverTrafficDistribution,
    /// Directory for persistent fragment and egress state
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_dir: Option<PathBuf>,
}

/// Loopback simulation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationConfig {
    /// Peer the local user sends to (same provider)
    #[serde(default = "default_peer")]
    pub peer: String,
    /// Messages to send
    #[serde(default = "default_messages")]
    pub messages: usize,
    /// Payload size of each message in bytes
    #[serde(default = "default_message_size")]
    pub message_size: usize,
    /// One-way base latency in milliseconds
    #[serde(default = "default_latency")]
    pub latency_ms: u64,
    /// One-way jitter in milliseconds
    #[serde(default = "default_jitter")]
    pub jitter_ms: u64,
    /// Per-leg loss probability
    #[serde(default)]
    pub loss: f64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values

fn default_user() -> String {
    "alice".to_string()
}

fn default_provider() -> String {
    "provider.local".to_string()
}

fn default_block_payload_len() -> usize {
    DEFAULT_BLOCK_PAYLOAD
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_cover_interval() -> u64 {
    10_000
}

fn default_cover_distribution() -> CoverTrafficDistribution {
    CoverTrafficDistribution::Poisson
}

fn default_peer() -> String {
    "bob".to_string()
}

fn default_messages() -> usize {
    20
}

fn default_message_size() -> usize {
    4096
}

fn default_latency() -> u64 {
    50
}

fn default_jitter() -> u64 {
    20
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            user: default_user(),
            provider: default_provider(),
            block_payload_len: default_block_payload_len(),
            connect_timeout_secs: default_connect_timeout(),
            loop_service: None,
            cover_traffic: false,
            cover_interval_ms: default_cover_interval(),
            cover_distribution: default_cover_distribution(),
            storage_dir: None,
        }
    }
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            peer: default_peer(),
            messages: default_messages(),
            message_size: default_message_size(),
            latency_ms: default_latency(),
            jitter_ms: default_jitter(),
            loss: 0.0,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;

        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        fs::write(path, contents)?;
        Ok(())
    }

    /// Get default config path
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("courier/config.toml")
    }

    /// Load `path` if it exists, otherwise use defaults
    ///
    /// # Errors
    ///
    /// Returns an error if an existing file cannot be read or parsed.
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Parse the configured loop service address
    ///
    /// # Errors
    ///
    /// Returns an error if the address is not `user@provider`.
    pub fn loop_service(&self) -> anyhow::Result<Option<ServiceAddress>> {
        self.session
            .loop_service
            .as_deref()
            .map(|s| s.parse::<ServiceAddress>().map_err(anyhow::Error::from))
            .transpose()
    }

    /// Session configuration for the local user
    ///
    /// # Errors
    ///
    /// Returns an error if the loop service address is malformed.
    pub fn session_config(&self) -> anyhow::Result<SessionConfig> {
        self.session_config_for(&self.session.user)
    }

    /// Session configuration for `user` on the configured provider
    ///
    /// # Errors
    ///
    /// Returns an error if the loop service address is malformed.
    pub fn session_config_for(&self, user: &str) -> anyhow::Result<SessionConfig> {
        Ok(SessionConfig {
            arq: self.arq,
            block_payload_len: self.session.block_payload_len,
            connect_timeout: Duration::from_secs(self.session.connect_timeout_secs),
            loop_service: self.loop_service()?,
            cover_traffic: CoverTrafficConfig {
                enabled: self.session.cover_traffic,
                mean_interval: Duration::from_millis(self.session.cover_interval_ms),
                distribution: self.session.cover_distribution,
            },
            ..SessionConfig::new(user, self.session.provider.clone())
        })
    }

    /// Loopback network parameters
    #[must_use]
    pub fn loopback(&self) -> LoopbackConfig {
        LoopbackConfig {
            latency: Duration::from_millis(self.simulation.latency_ms),
            jitter: Duration::from_millis(self.simulation.jitter_ms),
            loss: self.simulation.loss,
        }
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns an error if configuration is invalid.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.session_config()?.validate()?;

        if self.simulation.peer.is_empty() || self.simulation.peer == self.session.user {
            anyhow::bail!("Simulation peer must be a user other than {}", self.session.user);
        }

        if !(0.0..=1.0).contains(&self.simulation.loss) {
            anyhow::bail!("Loss must be between 0.0 and 1.0");
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!(
                "Invalid log level: {}. Must be one of: {}",
                self.logging.level,
                valid_log_levels.join(", ")
            );
        }

        Ok(())
    }
}
