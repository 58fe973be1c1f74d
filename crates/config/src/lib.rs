//! Proxy configuration: environment variables merged over the JSON config
//! file at `~/.config/antigravity-proxy/config.json`.

#![deny(missing_docs)]

mod loader;

use std::{collections::BTreeMap, net::SocketAddr, path::PathBuf};

use secrecy::SecretString;
use serde::Deserialize;

pub use loader::EnvOverrides;

/// Cloud-Code endpoint fallback order: primary first, then geo alternates.
pub const DEFAULT_CLOUD_ENDPOINTS: &[&str] = &[
    "https://cloudcode-pa.googleapis.com",
    "https://us-cloudcode-pa.googleapis.com",
    "https://eu-cloudcode-pa.googleapis.com",
];

/// Default OpenAI-compatible endpoint for `local-*`/`gemma-*` models.
pub const DEFAULT_LOCAL_LLM_URL: &str = "http://localhost:1234/v1/chat/completions";

pub(crate) const DEFAULT_PORT: u16 = 8080;

/// Main configuration structure for the proxy.
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP listener settings.
    pub server: ServerConfig,
    /// Local OpenAI-compatible endpoint settings.
    pub local: LocalLlmConfig,
    /// Cloud-Code upstream settings.
    pub cloud: CloudConfig,
    /// Model fallback settings.
    pub fallback: FallbackConfig,
    /// Model alias rewrites, applied before any validation.
    pub model_mapping: BTreeMap<String, String>,
}

/// HTTP listener settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// The socket address the proxy listens on. The listener trusts
    /// localhost; there is no downstream authentication.
    pub listen_address: SocketAddr,
    /// Raises the log filter to `debug` when set.
    pub debug: bool,
}

/// Local OpenAI-compatible endpoint settings.
#[derive(Debug, Clone)]
pub struct LocalLlmConfig {
    /// Chat completions URL, e.g. an LM Studio or llama.cpp server.
    pub url: String,
    /// Optional bearer token sent to the local endpoint.
    pub api_key: Option<SecretString>,
}

/// Cloud-Code upstream settings.
#[derive(Debug, Clone)]
pub struct CloudConfig {
    /// Ordered endpoint fallback list (primary, then geo alternates).
    pub endpoints: Vec<String>,
    /// Directory holding the persisted account store.
    pub account_store: PathBuf,
}

impl CloudConfig {
    /// Path of the accounts file inside the store directory.
    pub fn accounts_path(&self) -> PathBuf {
        self.account_store.join("accounts.json")
    }

    /// Path of the best-effort legacy token extract inside the store directory.
    pub fn legacy_token_path(&self) -> PathBuf {
        self.account_store.join("legacy-token.json")
    }
}

/// Model fallback settings. When the pool is exhausted for a model and a
/// fallback is configured, the request is re-dispatched once with the
/// fallback model.
#[derive(Debug, Clone, Default)]
pub struct FallbackConfig {
    /// Enabled via the `FALLBACK` environment variable.
    pub enabled: bool,
    /// Map of model to its fallback model.
    pub models: BTreeMap<String, String>,
}

impl FallbackConfig {
    /// Returns the configured fallback for a model, if any.
    pub fn model_for(&self, model: &str) -> Option<&str> {
        self.models.get(model).map(String::as_str)
    }
}

/// On-disk shape of `config.json`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub(crate) struct FileConfig {
    pub(crate) model_mapping: BTreeMap<String, ModelMappingEntry>,
    pub(crate) fallback_models: BTreeMap<String, String>,
    pub(crate) endpoints: Vec<String>,
    pub(crate) local_llm_url: Option<String>,
}

/// A single alias rewrite: `{ "alias": { "mapping": "canonical" } }`.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ModelMappingEntry {
    pub(crate) mapping: String,
}

impl Config {
    /// Load configuration from the default file location and the process
    /// environment.
    pub fn load() -> anyhow::Result<Config> {
        loader::load(None, EnvOverrides::from_process_env())
    }

    /// Load configuration from an explicit config file path and the process
    /// environment.
    pub fn load_from(path: &std::path::Path) -> anyhow::Result<Config> {
        loader::load(Some(path), EnvOverrides::from_process_env())
    }
}
