//! Configuration module for the frame-echo server.
//!
//! Supports command-line arguments, environment variables and a TOML
//! configuration file. CLI/env values take precedence over file values.

use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Command-line arguments for the server
#[derive(Parser, Debug, Default)]
#[command(name = "frame-echo")]
#[command(author = "frame-echo authors")]
#[command(version = "0.1.0")]
#[command(about = "A length-prefixed TCP echo server", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long, env = "FRAME_ECHO_CONFIG")]
    pub config: Option<PathBuf>,

    /// Host to bind to (e.g., 0.0.0.0)
    #[arg(long, env = "FRAME_ECHO_HOST")]
    pub host: Option<String>,

    /// Port to bind to (0 picks an ephemeral port)
    #[arg(short, long, env = "FRAME_ECHO_PORT")]
    pub port: Option<u16>,

    /// Maximum number of concurrent sessions
    #[arg(short = 'n', long, env = "FRAME_ECHO_MAX_SESSIONS")]
    pub max_sessions: Option<usize>,

    /// Maximum request frame payload in bytes
    #[arg(short = 'f', long, env = "FRAME_ECHO_MAX_FRAME_SIZE")]
    pub max_frame_size: Option<usize>,

    /// Seconds to wait for a complete request frame before closing a session
    #[arg(long, env = "FRAME_ECHO_READ_TIMEOUT")]
    pub read_timeout: Option<u64>,

    /// Seconds to wait for sessions to drain on shutdown
    #[arg(long, env = "FRAME_ECHO_DRAIN_TIMEOUT")]
    pub drain_timeout: Option<u64>,

    /// Number of worker threads (defaults to number of CPU cores)
    #[arg(short = 'w', long, env = "FRAME_ECHO_WORKERS")]
    pub workers: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "FRAME_ECHO_LOG_LEVEL")]
    pub log_level: Option<String>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub limits: LimitsSection,
    #[serde(default)]
    pub timeouts: TimeoutsSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

/// Listening socket configuration
#[derive(Debug, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub workers: Option<usize>,
    /// Listen backlog passed to `listen(2)`
    #[serde(default = "default_backlog")]
    pub backlog: i32,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            workers: None,
            backlog: default_backlog(),
        }
    }
}

/// Resource ceilings
#[derive(Debug, Deserialize)]
pub struct LimitsSection {
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
}

impl Default for LimitsSection {
    fn default() -> Self {
        Self {
            max_sessions: default_max_sessions(),
            max_frame_size: default_max_frame_size(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct TimeoutsSection {
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_secs: u64,
}

impl Default for TimeoutsSection {
    fn default() -> Self {
        Self {
            read_timeout_secs: default_read_timeout(),
            drain_timeout_secs: default_drain_timeout(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingSection {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    9000
}

fn default_backlog() -> i32 {
    1024
}

fn default_max_sessions() -> usize {
    1024
}

fn default_max_frame_size() -> usize {
    1024 * 1024 // 1 MiB
}

fn default_read_timeout() -> u64 {
    30
}

fn default_drain_timeout() -> u64 {
    10
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration. Immutable once the listener starts.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub max_sessions: usize,
    pub max_frame_size: usize,
    pub read_timeout: Duration,
    pub drain_timeout: Duration,
    pub backlog: i32,
    pub workers: Option<usize>,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::merge(CliArgs::default(), TomlConfig::default())
    }
}

impl Config {
    /// Load configuration from CLI args, environment and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(CliArgs::parse())
    }

    /// Resolve configuration from already-parsed arguments.
    pub fn from_args(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let config = Self::merge(cli, toml_config);
        config.validate()?;
        Ok(config)
    }

    /// Merge CLI args with TOML config (CLI takes precedence)
    fn merge(cli: CliArgs, file: TomlConfig) -> Self {
        Config {
            host: cli.host.unwrap_or(file.server.host),
            port: cli.port.unwrap_or(file.server.port),
            max_sessions: cli.max_sessions.unwrap_or(file.limits.max_sessions),
            max_frame_size: cli.max_frame_size.unwrap_or(file.limits.max_frame_size),
            read_timeout: Duration::from_secs(
                cli.read_timeout.unwrap_or(file.timeouts.read_timeout_secs),
            ),
            drain_timeout: Duration::from_secs(
                cli.drain_timeout.unwrap_or(file.timeouts.drain_timeout_secs),
            ),
            backlog: file.server.backlog,
            workers: cli.workers.or(file.server.workers),
            log_level: cli.log_level.unwrap_or(file.logging.level),
        }
    }

    /// Reject values the server cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_sessions == 0 {
            return Err(ConfigError::Invalid("max_sessions must be at least 1".into()));
        }
        if self.max_frame_size == 0 || self.max_frame_size > u32::MAX as usize {
            return Err(ConfigError::Invalid(format!(
                "max_frame_size must be between 1 and {}",
                u32::MAX
            )));
        }
        if self.read_timeout.is_zero() {
            return Err(ConfigError::Invalid("read_timeout must be non-zero".into()));
        }
        if self.drain_timeout.is_zero() {
            return Err(ConfigError::Invalid("drain_timeout must be non-zero".into()));
        }
        if self.workers == Some(0) {
            return Err(ConfigError::Invalid("workers must be at least 1".into()));
        }
        Ok(())
    }

    /// `host:port` string used for binding and logging.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{}': {}", .0.display(), .1)]
    FileRead(PathBuf, std::io::Error),
    #[error("failed to parse config file '{}': {}", .0.display(), .1)]
    TomlParse(PathBuf, toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}
