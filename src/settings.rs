use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, ensure};
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};

use crate::cli::{Cli, LogFormat, LogLevel};
use crate::proxy::origin::Origin;

const DEFAULT_CONFIG_FILE: &str = "caching-proxy.toml";
const CACHE_DIR_NAME: &str = "caching-proxy";

fn default_listen_address() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_port() -> u16 {
    3000
}

fn default_cache_mode() -> CacheMode {
    CacheMode::Disk
}

fn default_log_format() -> LogFormat {
    LogFormat::Text
}

fn default_log_level() -> LogLevel {
    LogLevel::Info
}

fn default_client_timeout() -> u64 {
    30
}

fn default_upstream_connect_timeout() -> u64 {
    5
}

fn default_upstream_timeout() -> u64 {
    60
}

fn default_shutdown_grace_period() -> u64 {
    5
}

fn default_max_header_size() -> usize {
    32 * 1024
}

fn default_max_response_header_size() -> usize {
    32 * 1024
}

fn default_max_request_body_size() -> usize {
    64 * 1024 * 1024
}

/// Which store backs the response cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum CacheMode {
    Disk,
    Memory,
    Off,
}

impl CacheMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheMode::Disk => "disk",
            CacheMode::Memory => "memory",
            CacheMode::Off => "off",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default = "default_listen_address")]
    pub listen_address: IpAddr,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub origin: Option<String>,
    #[serde(default = "default_cache_mode")]
    pub cache: CacheMode,
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,
    #[serde(default = "default_log_format")]
    pub log: LogFormat,
    #[serde(default = "default_log_level")]
    pub log_level: LogLevel,
    #[serde(default = "default_client_timeout")]
    pub client_timeout: u64,
    #[serde(default = "default_upstream_connect_timeout")]
    pub upstream_connect_timeout: u64,
    #[serde(default = "default_upstream_timeout")]
    pub upstream_timeout: u64,
    #[serde(default = "default_shutdown_grace_period")]
    pub shutdown_grace_period: u64,
    #[serde(default = "default_max_header_size")]
    pub max_request_header_size: usize,
    #[serde(default = "default_max_response_header_size")]
    pub max_response_header_size: usize,
    #[serde(default = "default_max_request_body_size")]
    pub max_request_body_size: usize,
    #[serde(default)]
    pub metrics_listen: Option<SocketAddr>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            listen_address: default_listen_address(),
            port: default_port(),
            origin: None,
            cache: default_cache_mode(),
            cache_dir: None,
            log: default_log_format(),
            log_level: default_log_level(),
            client_timeout: default_client_timeout(),
            upstream_connect_timeout: default_upstream_connect_timeout(),
            upstream_timeout: default_upstream_timeout(),
            shutdown_grace_period: default_shutdown_grace_period(),
            max_request_header_size: default_max_header_size(),
            max_response_header_size: default_max_response_header_size(),
            max_request_body_size: default_max_request_body_size(),
            metrics_listen: None,
        }
    }
}

impl Settings {
    /// Layers serde defaults, the optional config file, `CACHING_PROXY__*` environment
    /// variables and finally command-line flags.
    pub fn load(cli: &Cli) -> Result<Self> {
        let mut builder = Config::builder();
        let config_path = resolve_config_path(cli);

        if let Some(path) = &config_path {
            builder = builder.add_source(File::from(path.clone()).required(true));
        }

        builder = builder.add_source(
            Environment::with_prefix("CACHING_PROXY")
                .separator("__")
                .try_parsing(true),
        );

        builder = builder
            .set_override_option("port", cli.port.map(i64::from))
            .and_then(|builder| builder.set_override_option("origin", cli.origin.clone()))
            .and_then(|builder| {
                builder.set_override_option("cache", cli.cache.map(|mode| mode.as_str()))
            })
            .and_then(|builder| {
                builder.set_override_option(
                    "cache_dir",
                    cli.cache_dir
                        .as_ref()
                        .map(|dir| dir.to_string_lossy().into_owned()),
                )
            })
            .and_then(|builder| {
                builder.set_override_option("log", cli.log_format.map(|format| format.as_str()))
            })
            .and_then(|builder| {
                builder.set_override_option("log_level", cli.log_level.map(|level| level.as_str()))
            })
            .map_err(to_anyhow)?;

        let cfg = builder.build().map_err(to_anyhow)?;
        let mut settings: Settings = cfg.try_deserialize().map_err(to_anyhow)?;
        if let Some(path) = &config_path
            && cli.cache_dir.is_none()
        {
            settings.apply_base_dir(path);
        }
        settings.validate()?;
        Ok(settings)
    }

    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.listen_address, self.port)
    }

    /// The parsed origin. Serving requires one; maintenance commands do not.
    pub fn origin(&self) -> Result<Origin> {
        let raw = self.origin.as_deref().ok_or_else(|| {
            anyhow!("no origin configured; pass --origin or set origin in the config file")
        })?;
        Origin::parse(raw).with_context(|| format!("invalid origin '{raw}'"))
    }

    /// Configured cache directory, or the per-user default
    /// (`$XDG_CACHE_HOME/caching-proxy`, `~/.cache/caching-proxy`).
    pub fn cache_dir(&self) -> Result<PathBuf> {
        if let Some(dir) = &self.cache_dir {
            return Ok(dir.clone());
        }
        dirs::cache_dir()
            .or_else(|| dirs::home_dir().map(|home| home.join(".cache")))
            .map(|base| base.join(CACHE_DIR_NAME))
            .ok_or_else(|| anyhow!("could not determine a cache directory; set cache_dir"))
    }

    pub fn client_timeout(&self) -> Duration {
        Duration::from_secs(self.client_timeout)
    }

    pub fn upstream_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_connect_timeout)
    }

    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_timeout)
    }

    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_period)
    }

    pub fn debug_logging(&self) -> bool {
        self.log_level == LogLevel::Debug
    }
}

fn to_anyhow(err: ConfigError) -> anyhow::Error {
    anyhow::anyhow!(err)
}

impl Cli {
    pub fn config_path(&self) -> Option<&Path> {
        self.config.as_deref()
    }
}

fn resolve_config_path(cli: &Cli) -> Option<PathBuf> {
    if let Some(path) = cli.config_path() {
        return Some(path.to_path_buf());
    }
    let candidate = PathBuf::from(DEFAULT_CONFIG_FILE);
    candidate.exists().then_some(candidate)
}

impl Settings {
    fn apply_base_dir(&mut self, config_path: &Path) {
        let base_dir = config_path
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));

        if let Some(cache_dir) = self.cache_dir.clone() {
            self.cache_dir = Some(absolutize(&cache_dir, base_dir));
        }
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(self.port > 0, "port must be greater than 0 (got {})", self.port);
        ensure!(
            self.max_request_header_size > 0,
            "max_request_header_size must be greater than 0 (got {})",
            self.max_request_header_size
        );
        ensure!(
            self.max_response_header_size > 0,
            "max_response_header_size must be greater than 0 (got {})",
            self.max_response_header_size
        );
        ensure!(
            self.max_request_body_size > 0,
            "max_request_body_size must be greater than 0 (got {})",
            self.max_request_body_size
        );
        ensure!(
            self.client_timeout > 0,
            "client_timeout must be greater than 0 seconds (got {})",
            self.client_timeout
        );
        ensure!(
            self.upstream_connect_timeout > 0,
            "upstream_connect_timeout must be greater than 0 seconds (got {})",
            self.upstream_connect_timeout
        );
        ensure!(
            self.upstream_timeout > 0,
            "upstream_timeout must be greater than 0 seconds (got {})",
            self.upstream_timeout
        );
        ensure!(
            self.shutdown_grace_period > 0,
            "shutdown_grace_period must be greater than 0 seconds (got {})",
            self.shutdown_grace_period
        );
        if self.origin.is_some() {
            self.origin()?;
        }
        Ok(())
    }
}

fn absolutize(path: &Path, base: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}
