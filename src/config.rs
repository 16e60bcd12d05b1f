//! Configuration for the sdrop server.
//!
//! Supports both command-line arguments and a TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::runtime::StrategyKind;
use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::time::Duration;

/// Port served when no listen address is configured.
pub const DEFAULT_PORT: u16 = 8000;

/// Upper bound on `server.drain_timeout_secs`.
pub const MAX_DRAIN_TIMEOUT_SECS: u64 = 3600;

/// Execution strategy for a positive thread budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerType {
    /// One thread per connection, at most `threads` at once
    Threaded,
    /// Fixed worker pool, each connection handled start to finish
    Iterative,
    /// Fixed worker pool interleaving connections one step at a time
    Pipelining,
}

impl From<SchedulerType> for StrategyKind {
    fn from(kind: SchedulerType) -> Self {
        match kind {
            SchedulerType::Threaded => StrategyKind::Threaded,
            SchedulerType::Iterative => StrategyKind::Iterative,
            SchedulerType::Pipelining => StrategyKind::Pipelining,
        }
    }
}

/// Command-line arguments for the drop server
#[derive(Parser, Debug)]
#[command(name = "sdrop")]
#[command(version)]
#[command(about = "A temporary file drop server: POST once, GET once", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 0.0.0.0:8000); empty picks localhost
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Directory resources are stored under
    #[arg(short = 'r', long)]
    pub root: Option<PathBuf>,

    /// Join resources onto the root without confining them to it
    #[arg(long)]
    pub no_isolate: bool,

    /// Thread budget: 0 runs inline, negative is unbounded
    #[arg(short = 't', long, allow_negative_numbers = true)]
    pub threads: Option<i64>,

    /// Scheduler used for a positive thread budget
    #[arg(short = 's', long, value_enum)]
    pub scheduler: Option<SchedulerType>,

    /// Listen backlog
    #[arg(short = 'b', long)]
    pub backlog: Option<u32>,

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
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Listener and scheduling configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_backlog")]
    pub backlog: u32,
    /// Accept timeout in milliseconds
    #[serde(default = "default_accept_timeout_ms")]
    pub timeout_ms: u64,
    /// Thread budget (defaults to number of CPU cores)
    pub threads: Option<i64>,
    #[serde(default = "default_scheduler")]
    pub scheduler: SchedulerType,
    /// How long shutdown waits for in-flight connections
    #[serde(default = "default_drain_timeout_secs")]
    pub drain_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            backlog: default_backlog(),
            timeout_ms: default_accept_timeout_ms(),
            threads: None,
            scheduler: default_scheduler(),
            drain_timeout_secs: default_drain_timeout_secs(),
        }
    }
}

/// Per-connection configuration
#[derive(Debug, Deserialize)]
pub struct ConnectionConfig {
    /// Read timeout for a single socket read, in milliseconds
    #[serde(default = "default_conn_timeout_ms")]
    pub timeout_ms: u64,
    /// Close connections without progress for this long (0 = never)
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_conn_timeout_ms(),
            idle_timeout_secs: default_idle_timeout_secs(),
        }
    }
}

/// Storage configuration
#[derive(Debug, Deserialize)]
pub struct StorageConfig {
    /// Defaults to the working directory
    pub root: Option<PathBuf>,
    #[serde(default = "default_isolate")]
    pub isolate: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: None,
            isolate: default_isolate(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
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
    format!("0.0.0.0:{}", DEFAULT_PORT)
}

fn default_backlog() -> u32 {
    128
}

fn default_accept_timeout_ms() -> u64 {
    100
}

fn default_scheduler() -> SchedulerType {
    SchedulerType::Pipelining
}

fn default_drain_timeout_secs() -> u64 {
    5
}

fn default_conn_timeout_ms() -> u64 {
    10
}

fn default_idle_timeout_secs() -> u64 {
    30
}

fn default_isolate() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_threads() -> i64 {
    std::thread::available_parallelism()
        .map(|n| i64::try_from(n.get()).unwrap_or(1))
        .unwrap_or(1)
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// `None` binds the first address `localhost` resolves to.
    pub listen: Option<SocketAddr>,
    pub backlog: u32,
    pub accept_timeout: Duration,
    pub threads: i64,
    pub scheduler: SchedulerType,
    pub drain_timeout: Duration,
    pub conn_timeout: Duration,
    pub idle_timeout: Option<Duration>,
    pub root: PathBuf,
    pub isolate: bool,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: Some(SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT))),
            backlog: default_backlog(),
            accept_timeout: Duration::from_millis(default_accept_timeout_ms()),
            threads: default_threads(),
            scheduler: default_scheduler(),
            drain_timeout: Duration::from_secs(default_drain_timeout_secs()),
            conn_timeout: Duration::from_millis(default_conn_timeout_ms()),
            idle_timeout: Some(Duration::from_secs(default_idle_timeout_secs())),
            root: PathBuf::from("."),
            isolate: default_isolate(),
            log_level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Self::merge(cli, toml_config)
    }

    /// Merge CLI args over TOML values and validate the result.
    pub fn merge(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let listen = resolve_listen(&cli.listen.unwrap_or(toml_config.server.listen))?;

        let root = match cli.root.or(toml_config.storage.root) {
            Some(root) => root,
            None => std::env::current_dir().map_err(ConfigError::CurrentDir)?,
        };

        let idle_secs = toml_config.connection.idle_timeout_secs;

        let config = Config {
            listen,
            backlog: cli.backlog.unwrap_or(toml_config.server.backlog),
            accept_timeout: Duration::from_millis(toml_config.server.timeout_ms),
            threads: cli
                .threads
                .or(toml_config.server.threads)
                .unwrap_or_else(default_threads),
            scheduler: cli.scheduler.unwrap_or(toml_config.server.scheduler),
            drain_timeout: Duration::from_secs(toml_config.server.drain_timeout_secs),
            conn_timeout: Duration::from_millis(toml_config.connection.timeout_ms),
            idle_timeout: (idle_secs > 0).then(|| Duration::from_secs(idle_secs)),
            root,
            isolate: !cli.no_isolate && toml_config.storage.isolate,
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.backlog == 0 {
            return Err(ConfigError::Invalid("backlog must be positive".to_string()));
        }
        if self.accept_timeout.is_zero() {
            return Err(ConfigError::Invalid("server.timeout_ms must be positive".to_string()));
        }
        if self.conn_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "connection.timeout_ms must be positive".to_string(),
            ));
        }
        if self.drain_timeout > Duration::from_secs(MAX_DRAIN_TIMEOUT_SECS) {
            return Err(ConfigError::Invalid(format!(
                "server.drain_timeout_secs must be at most {MAX_DRAIN_TIMEOUT_SECS}"
            )));
        }
        Ok(())
    }
}

/// Empty means "pick a default"; anything else must resolve.
fn resolve_listen(listen: &str) -> Result<Option<SocketAddr>, ConfigError> {
    let listen = listen.trim();
    if listen.is_empty() {
        return Ok(None);
    }
    listen
        .to_socket_addrs()
        .map_err(|e| ConfigError::Listen(listen.to_string(), e.to_string()))?
        .next()
        .map(Some)
        .ok_or_else(|| ConfigError::Listen(listen.to_string(), "no addresses".to_string()))
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    Listen(String, String),
    CurrentDir(std::io::Error),
    Invalid(String),
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
            ConfigError::Listen(addr, e) => write!(f, "Invalid listen address '{}': {}", addr, e),
            ConfigError::CurrentDir(e) => write!(f, "Cannot determine working directory: {}", e),
            ConfigError::Invalid(msg) => write!(f, "Invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}
