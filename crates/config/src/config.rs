//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// Control API configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    /// Address the control API listens on
    #[serde(default = "default_bind_addr")]
    pub bind_addr: SocketAddr,
}

fn default_bind_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 7979))
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
        }
    }
}

/// How the external renderer is invoked
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RendererConfig {
    /// Value passed as `-v:<n>`; 5 is the level that prints per-frame progress
    #[serde(default = "default_verbosity")]
    pub verbosity: u8,
    /// Extension used when a job has no explicit output name
    #[serde(default = "default_output_extension")]
    pub output_extension: String,
    /// Extra base directories probed when auto-detecting the renderer
    #[serde(default)]
    pub search_dirs: Vec<PathBuf>,
    /// Environment overrides applied to every renderer process
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

fn default_verbosity() -> u8 {
    5
}

fn default_output_extension() -> String {
    "jpg".to_string()
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            verbosity: default_verbosity(),
            output_extension: default_output_extension(),
            search_dirs: Vec::new(),
            env: BTreeMap::new(),
        }
    }
}

/// Output format of the log subscriber
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

impl LogFormat {
    fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "compact" => Some(LogFormat::Compact),
            "json" => Some(LogFormat::Json),
            _ => None,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    /// Default filter directive (`RUST_LOG` still takes precedence)
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub renderer: RendererConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Parses the config.toml file and handles missing optional fields with defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Overrides the following values if environment variables are set:
    /// - MAXQUEUE_BIND_ADDR -> server.bind_addr
    /// - MAXQUEUE_RENDERER_VERBOSITY -> renderer.verbosity
    /// - MAXQUEUE_OUTPUT_EXTENSION -> renderer.output_extension
    /// - MAXQUEUE_LOG_LEVEL -> logging.level
    /// - MAXQUEUE_LOG_FORMAT -> logging.format
    ///
    /// Values that fail to parse are ignored and the existing value is kept.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("MAXQUEUE_BIND_ADDR") {
            if let Ok(addr) = val.parse::<SocketAddr>() {
                self.server.bind_addr = addr;
            }
        }

        if let Ok(val) = env::var("MAXQUEUE_RENDERER_VERBOSITY") {
            if let Ok(level) = val.parse::<u8>() {
                self.renderer.verbosity = level;
            }
        }

        if let Ok(val) = env::var("MAXQUEUE_OUTPUT_EXTENSION") {
            let ext = val.trim().trim_start_matches('.');
            if !ext.is_empty() {
                self.renderer.output_extension = ext.to_string();
            }
        }

        if let Ok(val) = env::var("MAXQUEUE_LOG_LEVEL") {
            if !val.trim().is_empty() {
                self.logging.level = val.trim().to_string();
            }
        }

        if let Ok(val) = env::var("MAXQUEUE_LOG_FORMAT") {
            if let Some(format) = LogFormat::parse(&val) {
                self.logging.format = format;
            }
        }
    }

    /// Load configuration from file and apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Like [`Config::load`], but a missing file yields the defaults
    pub fn load_optional<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = match Self::load_from_file(path) {
            Ok(config) => config,
            Err(ConfigError::Io(e)) if e.kind() == ErrorKind::NotFound => Config::default(),
            Err(e) => return Err(e),
        };
        config.apply_env_overrides();
        Ok(config)
    }
}
