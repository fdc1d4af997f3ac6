use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::steps::TerminalOverwrite;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub channel: ChannelConfig,
    #[serde(default)]
    pub identity: IdentityConfig,
    #[serde(default)]
    pub progress: ProgressConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Realtime socket configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Base socket endpoint; `userId` is appended as a query parameter
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    /// Reconnect attempts after an abnormal close before giving up (default: 5)
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    /// Delay before the first reconnect, doubled on each attempt (default: 1000)
    #[serde(default = "default_reconnect_base_delay_ms")]
    pub reconnect_base_delay_ms: u64,
    /// Upper bound for the reconnect delay (default: 30000)
    #[serde(default = "default_reconnect_max_delay_ms")]
    pub reconnect_max_delay_ms: u64,
    /// How long `cleanup` waits for the connection task before aborting it (default: 2000)
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
}

fn default_endpoint() -> String {
    "wss://localhost/ws/progress".to_string()
}

fn default_max_reconnect_attempts() -> u32 {
    5
}

fn default_reconnect_base_delay_ms() -> u64 {
    1000 // 1 second
}

fn default_reconnect_max_delay_ms() -> u64 {
    30_000 // 30 seconds
}

fn default_shutdown_timeout_ms() -> u64 {
    2000
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            reconnect_base_delay_ms: default_reconnect_base_delay_ms(),
            reconnect_max_delay_ms: default_reconnect_max_delay_ms(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
        }
    }
}

impl ChannelConfig {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

/// Where the caller's user id comes from
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityConfig {
    /// Fixed user id; takes precedence over `env_var`
    #[serde(default)]
    pub user_id: Option<String>,
    /// Environment variable holding the user id
    #[serde(default = "default_identity_env_var")]
    pub env_var: String,
}

fn default_identity_env_var() -> String {
    "OPTRACK_USER_ID".to_string()
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            user_id: None,
            env_var: default_identity_env_var(),
        }
    }
}

/// Step reconciliation settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProgressConfig {
    /// Whether a terminal step may be moved to the other terminal status
    /// Options: allow, reject
    #[serde(default)]
    pub terminal_overwrite: TerminalOverwrite,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Write logs to this file instead of stderr
    #[serde(default)]
    pub file: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

impl Config {
    /// Path to the user-level config file, if a config dir exists
    pub fn user_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("optrack").join("config.toml"))
    }

    pub fn load(config_path: Option<&str>) -> Result<Self> {
        // Start with embedded defaults so nothing requires a config file
        let defaults = Config::default();
        let defaults_json =
            serde_json::to_string(&defaults).context("Failed to serialize default config")?;

        let mut builder = config::Config::builder().add_source(config::File::from_str(
            &defaults_json,
            config::FileFormat::Json,
        ));

        // User config in ~/.config/optrack/ (optional global overrides)
        if let Some(user_config) = Self::user_config_path() {
            if user_config.exists() {
                builder = builder.add_source(config::File::from(user_config));
            }
        }

        // Explicit config file
        if let Some(path) = config_path {
            builder = builder.add_source(config::File::with_name(path));
        }

        // Environment variables with OPTRACK_ prefix, `__` between nested keys
        builder = builder.add_source(
            config::Environment::with_prefix("OPTRACK")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build().context("Failed to load configuration")?;
        config
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }
}
