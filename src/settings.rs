use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Result, ensure};
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use crate::cli::{Cli, LogFormat};

const DEFAULT_CONFIG_FILE: &str = "stashproxy.toml";
const ENV_PREFIX: &str = "STASHPROXY";

fn default_listen() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8888))
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("cache")
}

fn default_log_format() -> LogFormat {
    LogFormat::Text
}

fn default_client_timeout() -> u64 {
    30
}

fn default_origin_port() -> u16 {
    80
}

fn default_origin_connect_timeout() -> u64 {
    5
}

fn default_origin_read_timeout() -> u64 {
    30
}

fn default_max_request_header_size() -> usize {
    32 * 1024
}

fn default_max_response_size() -> usize {
    64 * 1024 * 1024
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
    #[serde(default = "default_log_format")]
    pub log: LogFormat,
    #[serde(default = "default_client_timeout")]
    pub client_timeout: u64,
    #[serde(default = "default_origin_port")]
    pub origin_port: u16,
    #[serde(default = "default_origin_connect_timeout")]
    pub origin_connect_timeout: u64,
    #[serde(default = "default_origin_read_timeout")]
    pub origin_read_timeout: u64,
    #[serde(default = "default_max_request_header_size")]
    pub max_request_header_size: usize,
    #[serde(default = "default_max_response_size")]
    pub max_response_size: usize,
    #[serde(default)]
    pub metrics_listen: Option<SocketAddr>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            cache_dir: default_cache_dir(),
            log: default_log_format(),
            client_timeout: default_client_timeout(),
            origin_port: default_origin_port(),
            origin_connect_timeout: default_origin_connect_timeout(),
            origin_read_timeout: default_origin_read_timeout(),
            max_request_header_size: default_max_request_header_size(),
            max_response_size: default_max_response_size(),
            metrics_listen: None,
        }
    }
}

impl Settings {
    /// Layers built-in defaults, the configuration file (if any), `STASHPROXY__*`
    /// environment variables, and finally command-line overrides.
    pub fn load(cli: &Cli) -> Result<Self> {
        let mut builder = Config::builder();
        let config_path = resolve_config_path(cli);

        if let Some(path) = &config_path {
            builder = builder.add_source(File::from(path.clone()).required(cli.config.is_some()));
        }

        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );

        let cfg = builder.build().map_err(to_anyhow)?;
        let mut settings: Settings = cfg.try_deserialize().map_err(to_anyhow)?;
        if let Some(path) = &config_path {
            settings.apply_base_dir(path);
        }
        settings.apply_cli_overrides(cli);
        settings.validate()?;
        Ok(settings)
    }

    pub fn client_timeout(&self) -> Duration {
        Duration::from_secs(self.client_timeout)
    }

    pub fn origin_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.origin_connect_timeout)
    }

    pub fn origin_read_timeout(&self) -> Duration {
        Duration::from_secs(self.origin_read_timeout)
    }

    fn apply_base_dir(&mut self, config_path: &Path) {
        let base_dir = config_path
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        self.cache_dir = absolutize(&self.cache_dir, base_dir);
    }

    fn apply_cli_overrides(&mut self, cli: &Cli) {
        if let Some(listen) = cli.listen {
            self.listen = listen;
        }
        if let Some(cache_dir) = &cli.cache_dir {
            self.cache_dir = cache_dir.clone();
        }
        if let Some(log) = cli.log {
            self.log = log;
        }
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            !self.cache_dir.as_os_str().is_empty(),
            "cache_dir must not be empty"
        );
        ensure!(
            self.client_timeout > 0,
            "client_timeout must be greater than 0 seconds (got {})",
            self.client_timeout
        );
        ensure!(
            self.origin_port > 0,
            "origin_port must be greater than 0 (got {})",
            self.origin_port
        );
        ensure!(
            self.origin_connect_timeout > 0,
            "origin_connect_timeout must be greater than 0 seconds (got {})",
            self.origin_connect_timeout
        );
        ensure!(
            self.origin_read_timeout > 0,
            "origin_read_timeout must be greater than 0 seconds (got {})",
            self.origin_read_timeout
        );
        ensure!(
            self.max_request_header_size > 0,
            "max_request_header_size must be greater than 0 (got {})",
            self.max_request_header_size
        );
        ensure!(
            self.max_response_size > 0,
            "max_response_size must be greater than 0 (got {})",
            self.max_response_size
        );
        Ok(())
    }
}

fn to_anyhow(err: ConfigError) -> anyhow::Error {
    anyhow::anyhow!(err)
}

fn resolve_config_path(cli: &Cli) -> Option<PathBuf> {
    if let Some(path) = &cli.config {
        return Some(path.clone());
    }
    let candidate = PathBuf::from(DEFAULT_CONFIG_FILE);
    candidate.exists().then_some(candidate)
}

fn absolutize(path: &Path, base: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}
