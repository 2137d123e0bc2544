use std::{env, fs, path};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to read config file: {0}")]
    ReadFailed(#[source] std::io::Error),
    #[error("failed to write config file: {0}")]
    WriteFailed(#[source] std::io::Error),
    #[error("failed to parse config file: {0}")]
    ParseFailed(#[from] toml::de::Error),
    #[error("failed to serialize config: {0}")]
    SerializeFailed(#[from] toml::ser::Error),
    #[error("no config path available (set XDG_CONFIG_HOME or HOME)")]
    ConfigPathUnavailable,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub mailer: MailerConfig,
    /// Vantage points checks are issued from. A region without a
    /// `health_url` is assumed reachable (the local process itself).
    #[serde(default = "default_regions")]
    pub regions: Vec<RegionConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self { path: "upwatch.db".into() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum checks in flight at once across all monitors and regions.
    pub concurrency: usize,
    /// Per-probe timeout, HTTP and TCP alike.
    pub probe_timeout_seconds: u64,
    /// How often the worker pool polls the job queue.
    pub queue_poll_ms: u64,
    /// How long shutdown waits for in-flight checks before aborting them.
    pub shutdown_grace_seconds: u64,
    /// Region health sweep cadence.
    pub region_sweep_seconds: u64,
    /// Schedule reconciliation sweep cadence.
    pub reconcile_seconds: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            concurrency: 10,
            probe_timeout_seconds: 10,
            queue_poll_ms: 500,
            shutdown_grace_seconds: 30,
            region_sweep_seconds: 60,
            reconcile_seconds: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailerConfig {
    /// HTTP email API endpoint alert mails are posted to.
    pub api_url: String,
    pub api_key: String,
    pub from: String,
}

impl Default for MailerConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.resend.com/emails".into(),
            api_key: String::new(),
            from: "alerts@upwatch.local".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegionConfig {
    pub name: String,
    #[serde(default)]
    pub health_url: Option<String>,
}

fn default_regions() -> Vec<RegionConfig> {
    vec![RegionConfig { name: "local".into(), health_url: None }]
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            engine: EngineConfig::default(),
            mailer: MailerConfig::default(),
            regions: default_regions(),
        }
    }
}

/// Used to ensure we are actually reading a toml file
fn normalize_toml_path(path: &path::Path) -> path::PathBuf {
    let mut path = path.to_path_buf();
    if path.extension().map(|ext| ext != "toml").unwrap_or(true) {
        path.set_extension("toml");
    }
    path
}

/// Get default config path ($XDG_CONFIG_HOME/upwatch/config.toml or
/// $HOME/.config/...)
fn default_config_path() -> Result<path::PathBuf, Error> {
    let path = if let Ok(config_home) = env::var("XDG_CONFIG_HOME") {
        path::PathBuf::from(config_home)
    } else if let Some(home_dir) = env::home_dir() {
        home_dir.join(".config")
    } else {
        return Err(Error::ConfigPathUnavailable);
    };

    Ok(path.join("upwatch/config.toml"))
}

impl Config {
    /// Load configuration from the given path, or from the default
    /// location. Writes a default config file when none exists yet.
    pub fn from_config(optional_path: Option<impl AsRef<path::Path>>) -> Result<Self, Error> {
        let config_path: path::PathBuf = if let Some(path) = optional_path {
            normalize_toml_path(path.as_ref())
        } else {
            default_config_path()?
        };

        if config_path.exists() {
            let raw = fs::read_to_string(&config_path).map_err(Error::ReadFailed)?;
            Ok(toml::from_str(&raw)?)
        } else {
            let config = Self::default();
            config.write_config(&config_path)?;
            Ok(config)
        }
    }

    /// Serialize and write a config to a file
    pub fn write_config(&self, path: &path::Path) -> Result<(), Error> {
        let config_str = toml::to_string_pretty(self)?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(Error::WriteFailed)?;
        }

        fs::write(path, config_str).map_err(Error::WriteFailed)
    }
}
