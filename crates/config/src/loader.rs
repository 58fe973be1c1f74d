use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::{Path, PathBuf},
};

use anyhow::Context;
use secrecy::SecretString;

use crate::{
    CloudConfig, Config, DEFAULT_CLOUD_ENDPOINTS, DEFAULT_LOCAL_LLM_URL, DEFAULT_PORT, FallbackConfig, FileConfig,
    LocalLlmConfig, ServerConfig,
};

/// Environment variables consumed by the proxy, captured as a value so the
/// merge logic stays a pure function.
#[derive(Debug, Clone, Default)]
pub struct EnvOverrides {
    /// `PORT`
    pub port: Option<String>,
    /// `DEBUG`
    pub debug: Option<String>,
    /// `FALLBACK`
    pub fallback: Option<String>,
    /// `LOCAL_LLM_URL`
    pub local_llm_url: Option<String>,
    /// `LOCAL_LLM_KEY`
    pub local_llm_key: Option<String>,
}

impl EnvOverrides {
    /// Snapshot the relevant variables from the process environment.
    pub fn from_process_env() -> Self {
        Self {
            port: std::env::var("PORT").ok(),
            debug: std::env::var("DEBUG").ok(),
            fallback: std::env::var("FALLBACK").ok(),
            local_llm_url: std::env::var("LOCAL_LLM_URL").ok(),
            local_llm_key: std::env::var("LOCAL_LLM_KEY").ok(),
        }
    }
}

pub(crate) fn load(path: Option<&Path>, env: EnvOverrides) -> anyhow::Result<Config> {
    let file = match path {
        Some(path) => read_file_config(path)?,
        None => match default_config_path() {
            Some(path) if path.exists() => read_file_config(&path)?,
            _ => FileConfig::default(),
        },
    };

    merge(file, env)
}

fn read_file_config(path: &Path) -> anyhow::Result<FileConfig> {
    let content =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config file {}", path.display()))?;

    serde_json::from_str(&content).with_context(|| format!("malformed config file {}", path.display()))
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("antigravity-proxy").join("config.json"))
}

fn default_account_store() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".antigravity-claude-proxy")
}

fn merge(file: FileConfig, env: EnvOverrides) -> anyhow::Result<Config> {
    let port = match env.port {
        Some(raw) => raw
            .parse::<u16>()
            .with_context(|| format!("PORT must be a valid port number, got '{raw}'"))?,
        None => DEFAULT_PORT,
    };

    let endpoints = if file.endpoints.is_empty() {
        DEFAULT_CLOUD_ENDPOINTS.iter().map(|s| s.to_string()).collect()
    } else {
        file.endpoints
    };

    let url = env
        .local_llm_url
        .or(file.local_llm_url)
        .unwrap_or_else(|| DEFAULT_LOCAL_LLM_URL.to_string());

    let model_mapping = file
        .model_mapping
        .into_iter()
        .map(|(alias, entry)| (alias, entry.mapping))
        .collect();

    Ok(Config {
        server: ServerConfig {
            listen_address: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port),
            debug: is_truthy(env.debug.as_deref()),
        },
        local: LocalLlmConfig {
            url,
            api_key: env.local_llm_key.map(SecretString::from),
        },
        cloud: CloudConfig {
            endpoints,
            account_store: default_account_store(),
        },
        fallback: FallbackConfig {
            enabled: is_truthy(env.fallback.as_deref()),
            models: file.fallback_models,
        },
        model_mapping,
    })
}

fn is_truthy(value: Option<&str>) -> bool {
    matches!(value, Some("1") | Some("true") | Some("TRUE") | Some("yes"))
}
