//! Configuration for the grow-a-pool server binary.
//!
//! Supports both command-line arguments and a TOML configuration file.
//! CLI arguments take precedence over config file values. The library core
//! only ever sees the resolved [`Tunables`] and the parsed listen addresses.

use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;

use crate::addr::{AddrParseError, ListenAddr};

/// How a listener's worker pool is sized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpawnStrategy {
    /// Fixed worker count, set once at startup.
    Static,
    /// Worker count grows from the configured floor up to `workers_max`
    /// when all current workers are busy.
    Dynamic,
}

/// Per-listener tunables, with pool-level defaults.
#[derive(Debug, Clone)]
pub struct Tunables {
    /// Listen backlog size.
    pub backlog: i32,
    /// Read/write timeout applied to accepted connections, in seconds.
    /// Zero disables the timeout.
    pub timeout_secs: u64,
    /// Worker spawning strategy.
    pub strategy: SpawnStrategy,
    /// Configured worker count (the floor under the dynamic strategy).
    pub workers: usize,
    /// Maximum worker count; only meaningful under the dynamic strategy.
    pub workers_max: usize,
}

impl Default for Tunables {
    fn default() -> Self {
        let workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self {
            backlog: default_backlog(),
            timeout_secs: default_timeout(),
            strategy: SpawnStrategy::Static,
            workers,
            workers_max: workers,
        }
    }
}

/// Command-line arguments for the server
#[derive(Parser, Debug)]
#[command(name = "grow-a-pool")]
#[command(author = "grow-a-pool authors")]
#[command(version = "0.1.0")]
#[command(about = "A prefork-style socket server with a growing worker pool", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to listen on (repeatable): /abs/path, a.b.c.d:port, [v6]:port
    #[arg(short = 'l', long = "listen")]
    pub listen: Vec<String>,

    /// Number of worker threads per listener
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Maximum worker threads per listener (dynamic strategy only)
    #[arg(long)]
    pub max_workers: Option<usize>,

    /// Worker spawning strategy
    #[arg(short = 's', long, value_enum)]
    pub strategy: Option<SpawnStrategy>,

    /// Listen backlog size
    #[arg(long)]
    pub backlog: Option<i32>,

    /// Read/write timeout for connections in seconds (0 = no timeout)
    #[arg(short = 't', long)]
    pub timeout: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Addresses to listen on
    #[serde(default)]
    pub listen: Vec<String>,
    /// Number of worker threads per listener
    pub workers: Option<usize>,
    /// Maximum worker threads per listener
    pub max_workers: Option<usize>,
    /// Worker spawning strategy
    pub strategy: Option<SpawnStrategy>,
    /// Listen backlog size
    #[serde(default = "default_backlog")]
    pub backlog: i32,
    /// Connection timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: Vec::new(),
            workers: None,
            max_workers: None,
            strategy: None,
            backlog: default_backlog(),
            timeout: default_timeout(),
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

fn default_backlog() -> i32 {
    128
}

fn default_timeout() -> u64 {
    30
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listeners: Vec<ListenAddr>,
    pub tunables: Tunables,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();
        Self::resolve(cli)
    }

    fn resolve(cli: CliArgs) -> Result<Self, ConfigError> {
        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let defaults = Tunables::default();
        let workers = cli
            .workers
            .or(toml_config.server.workers)
            .unwrap_or(defaults.workers);
        let tunables = Tunables {
            backlog: cli.backlog.unwrap_or(toml_config.server.backlog),
            timeout_secs: cli.timeout.unwrap_or(toml_config.server.timeout),
            strategy: cli
                .strategy
                .or(toml_config.server.strategy)
                .unwrap_or(SpawnStrategy::Static),
            workers,
            workers_max: cli
                .max_workers
                .or(toml_config.server.max_workers)
                .unwrap_or(workers),
        };

        let raw_listeners = if cli.listen.is_empty() {
            toml_config.server.listen
        } else {
            cli.listen
        };
        let listeners = raw_listeners
            .iter()
            .map(|s| {
                s.parse()
                    .map_err(|e| ConfigError::BadAddress(s.clone(), e))
            })
            .collect::<Result<Vec<ListenAddr>, ConfigError>>()?;

        Ok(Config {
            listeners,
            tunables,
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        })
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    BadAddress(String, AddrParseError),
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
            ConfigError::BadAddress(addr, e) => {
                write!(f, "Bad listen address '{}': {}", addr, e)
            }
        }
    }
}

impl std::error::Error for ConfigError {}
