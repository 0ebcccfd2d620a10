use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Parser)]
#[command(name = "stashproxy", about = "Forward HTTP proxy with an on-disk response cache")]
pub struct Cli {
    /// Path to the configuration file (defaults to ./stashproxy.toml if present).
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Address to accept proxy connections on (overrides `listen`).
    #[arg(long)]
    pub listen: Option<SocketAddr>,

    /// Directory holding cached responses (overrides `cache_dir`).
    #[arg(long)]
    pub cache_dir: Option<PathBuf>,

    /// Log output format (overrides `log`).
    #[arg(long, value_enum)]
    pub log: Option<LogFormat>,
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
