use std::{net::SocketAddr, path::PathBuf};

use clap::Parser;

/// A protocol-translating gateway exposing the Anthropic Messages API over
/// a pool of Cloud-Code accounts and local OpenAI-compatible endpoints.
#[derive(Debug, Parser)]
#[command(name = "antigravity-proxy", version)]
pub struct Args {
    /// Path to the config file (default:
    /// ~/.config/antigravity-proxy/config.json).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Listen address, overriding the PORT environment variable.
    #[arg(short, long)]
    pub listen: Option<SocketAddr>,

    /// Log filter, e.g. "info" or "gateway=debug".
    #[arg(long, env = "LOG_FILTER")]
    pub log: Option<String>,
}
