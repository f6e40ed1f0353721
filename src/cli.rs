use std::path::PathBuf;

use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::settings::CacheMode;

#[derive(Debug, Clone, Default, Parser)]
#[command(
    name = "caching-proxy",
    version,
    about = "Caching reverse proxy for a single origin"
)]
pub struct Cli {
    /// Path to the configuration file (defaults to ./caching-proxy.toml if present).
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Port to listen on.
    #[arg(long)]
    pub port: Option<u16>,

    /// Origin base URL, e.g. http://localhost:8080/api.
    #[arg(long)]
    pub origin: Option<String>,

    /// Directory holding cached responses.
    #[arg(long)]
    pub cache_dir: Option<PathBuf>,

    /// Cache backend.
    #[arg(long, value_enum)]
    pub cache: Option<CacheMode>,

    #[arg(long, value_enum)]
    pub log_level: Option<LogLevel>,

    #[arg(long, value_enum)]
    pub log_format: Option<LogFormat>,

    /// Remove every cached entry from the cache directory and exit.
    #[arg(long)]
    pub clear_cache: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Text,
}

impl LogFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogFormat::Json => "json",
            LogFormat::Text => "text",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Debug,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
        }
    }
}
