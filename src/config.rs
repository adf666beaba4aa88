//! Configuration module for echo-dispatch.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Readiness strategy the control process runs with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Mode {
    /// Blocking accept, every connection handed to the worker pool
    Basic,
    /// Level-triggered, interest list rebuilt on every wait
    #[value(alias = "level-list")]
    Select,
    /// Level-triggered, interest table updated incrementally
    #[value(alias = "level-table")]
    Poll,
    /// Edge-triggered (epoll on Linux, kqueue on macOS)
    #[value(alias = "edge-table")]
    Epoll,
}

/// Command-line arguments for the echo dispatcher
#[derive(Parser, Debug)]
#[command(name = "echo-dispatch")]
#[command(author = "echo-dispatch authors")]
#[command(version = "0.1.0")]
#[command(about = "Readiness-driven TCP echo dispatcher", long_about = None)]
pub struct CliArgs {
    /// Operating mode of the server
    #[arg(value_enum, required_unless_present = "serve_queue")]
    pub mode: Option<Mode>,

    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 127.0.0.1:8000)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// listen() backlog (0 = system default)
    #[arg(long)]
    pub backlog: Option<u32>,

    /// select/poll/epoll wait timeout in milliseconds
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Hand ready connections to worker processes instead of serving inline
    #[arg(long)]
    pub worker: bool,

    /// Number of worker processes in the hand-off pool
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Maximum number of simultaneously open connections
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Largest frame echoed back, in bytes
    #[arg(long)]
    pub max_frame: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Run as a hand-off worker reading connections from standard input
    #[arg(long, hide = true)]
    pub serve_queue: bool,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// listen() backlog, 0 selects the system default
    #[serde(default)]
    pub backlog: u32,
    /// Set SO_REUSEADDR on the listener
    #[serde(default = "default_true")]
    pub reuse_address: bool,
    /// Multiplexer wait timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_max_frame")]
    pub max_frame: usize,
    /// Readiness events fetched per wait
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            backlog: 0,
            reuse_address: true,
            timeout_ms: default_timeout_ms(),
            max_connections: default_max_connections(),
            max_frame: default_max_frame(),
            batch_size: default_batch_size(),
        }
    }
}

/// Worker hand-off configuration
#[derive(Debug, Deserialize)]
pub struct DispatchConfig {
    /// Enable hand-off in select/poll/epoll modes
    #[serde(default)]
    pub enabled: bool,
    /// Number of worker processes
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// How long workers get to drain the queue on shutdown, in milliseconds
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            workers: default_workers(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_listen() -> String {
    "127.0.0.1:8000".to_string()
}

fn default_true() -> bool {
    true
}

fn default_timeout_ms() -> u64 {
    1000
}

fn default_max_connections() -> usize {
    10_000
}

fn default_max_frame() -> usize {
    32
}

fn default_batch_size() -> usize {
    1024
}

fn default_workers() -> usize {
    1
}

fn default_shutdown_grace_ms() -> u64 {
    1000
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Which side of the hand-off this process runs as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Control process owning the listener.
    Control(Mode),
    /// Worker process consuming the hand-off queue on stdin.
    Worker,
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub role: Role,
    pub listen: String,
    pub backlog: u32,
    pub reuse_address: bool,
    pub timeout: Duration,
    pub worker: bool,
    pub workers: usize,
    pub shutdown_grace: Duration,
    pub max_connections: usize,
    pub max_frame: usize,
    pub batch_size: usize,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(CliArgs::parse())
    }

    pub fn from_args(cli: CliArgs) -> Result<Self, ConfigError> {
        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let role = match (cli.serve_queue, cli.mode) {
            (true, _) => Role::Worker,
            (false, Some(mode)) => Role::Control(mode),
            (false, None) => return Err(ConfigError::MissingMode),
        };

        let config = Config {
            role,
            listen: cli.listen.unwrap_or(toml_config.server.listen),
            backlog: cli.backlog.unwrap_or(toml_config.server.backlog),
            reuse_address: toml_config.server.reuse_address,
            timeout: Duration::from_millis(cli.timeout.unwrap_or(toml_config.server.timeout_ms)),
            worker: cli.worker || toml_config.dispatch.enabled,
            workers: cli.workers.unwrap_or(toml_config.dispatch.workers),
            shutdown_grace: Duration::from_millis(toml_config.dispatch.shutdown_grace_ms),
            max_connections: cli
                .max_connections
                .unwrap_or(toml_config.server.max_connections),
            max_frame: cli.max_frame.unwrap_or(toml_config.server.max_frame),
            batch_size: toml_config.server.batch_size,
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.timeout.is_zero() {
            return Err(ConfigError::Invalid("timeout must be at least 1 ms"));
        }
        if self.workers == 0 {
            return Err(ConfigError::Invalid("workers must be at least 1"));
        }
        if self.max_frame == 0 {
            return Err(ConfigError::Invalid("max_frame must be at least 1"));
        }
        if self.max_connections == 0 {
            return Err(ConfigError::Invalid("max_connections must be at least 1"));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::Invalid("batch_size must be at least 1"));
        }
        Ok(())
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    MissingMode,
    Invalid(&'static str),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::FileRead(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::TomlParse(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::MissingMode => {
                write!(f, "Available operating modes: basic, select, poll, epoll")
            }
            ConfigError::Invalid(msg) => write!(f, "Invalid configuration: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {}
