//! Account records and the persisted account store under
//! `~/.antigravity-claude-proxy/`.

use std::path::PathBuf;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

/// Where an account's credentials come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountSource {
    /// Enrolled through the OAuth flow; carries a refresh token.
    #[default]
    Oauth,
    /// Token extracted from the desktop app; refreshed best-effort.
    Legacy,
}

/// Per-(account, model) rate-limit record. Cleared when `now >=
/// reset_epoch_ms` or by an explicit reset.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitState {
    /// Whether the pair is currently limited.
    pub is_rate_limited: bool,
    /// When the limit lifts, epoch milliseconds.
    pub reset_epoch_ms: i64,
}

/// Last-known quota for one model on one account.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelQuota {
    /// Fraction of quota remaining, 0.0..=1.0.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining_fraction: Option<f64>,
    /// When the quota window resets, epoch milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reset_epoch_ms: Option<i64>,
}

/// Quota snapshot across models.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Quota {
    /// Per-model quota records.
    pub models: std::collections::BTreeMap<String, ModelQuota>,
    /// When the snapshot was last refreshed, epoch milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_checked: Option<i64>,
}

/// Subscription details reported by the backend.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Subscription {
    /// Subscription tier name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tier: Option<String>,
    /// Project bound to the subscription.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
}

/// One upstream identity. Loaded at startup, mutated by the pool, persisted
/// asynchronously.
#[derive(Debug, Clone)]
pub struct Account {
    /// Opaque identifier.
    pub email: String,
    /// Credential source.
    pub source: AccountSource,
    /// OAuth refresh token.
    pub refresh_token: Option<SecretString>,
    /// Project id used in the request envelope.
    pub project_id: Option<String>,
    /// Disabled accounts are never selected.
    pub enabled: bool,
    /// Set when credentials are known bad; holds the reason.
    pub invalid_reason: Option<String>,
    /// Last selection time, epoch milliseconds. Drives round-robin order.
    pub last_used: i64,
    /// Per-model rate-limit state.
    pub model_rate_limits: std::collections::BTreeMap<String, RateLimitState>,
    /// Subscription details.
    pub subscription: Subscription,
    /// Last-known quota.
    pub quota: Quota,
}

impl Account {
    /// Whether the account is known-bad.
    pub fn is_invalid(&self) -> bool {
        self.invalid_reason.is_some()
    }

    /// Project id to use: the explicit one, falling back to the
    /// subscription's.
    pub fn effective_project(&self) -> Option<&str> {
        self.project_id
            .as_deref()
            .or(self.subscription.project_id.as_deref())
    }

    /// Masked identity for public endpoints: `ab***@example.com`.
    pub fn display_name(&self) -> String {
        match self.email.split_once('@') {
            Some((local, domain)) => {
                let visible: String = local.chars().take(2).collect();
                format!("{visible}***@{domain}")
            }
            None => {
                let visible: String = self.email.chars().take(2).collect();
                format!("{visible}***")
            }
        }
    }
}

/// On-disk shape of one account, camelCase as written by the enrollment
/// tooling. Unknown fields are tolerated.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct StoredAccount {
    email: String,
    source: AccountSource,
    #[serde(skip_serializing_if = "Option::is_none")]
    refresh_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    project_id: Option<String>,
    enabled: Option<bool>,
    is_invalid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    invalid_reason: Option<String>,
    last_used: i64,
    model_rate_limits: std::collections::BTreeMap<String, RateLimitState>,
    subscription: Subscription,
    quota: Quota,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StoredAccounts {
    accounts: Vec<StoredAccount>,
}

impl From<StoredAccount> for Account {
    fn from(stored: StoredAccount) -> Self {
        Account {
            email: stored.email,
            source: stored.source,
            refresh_token: stored.refresh_token.map(SecretString::from),
            project_id: stored.project_id,
            enabled: stored.enabled.unwrap_or(true),
            invalid_reason: if stored.is_invalid {
                Some(stored.invalid_reason.unwrap_or_else(|| "marked invalid".to_string()))
            } else {
                None
            },
            last_used: stored.last_used,
            model_rate_limits: stored.model_rate_limits,
            subscription: stored.subscription,
            quota: stored.quota,
        }
    }
}

impl From<&Account> for StoredAccount {
    fn from(account: &Account) -> Self {
        StoredAccount {
            email: account.email.clone(),
            source: account.source,
            refresh_token: account
                .refresh_token
                .as_ref()
                .map(|token| token.expose_secret().to_string()),
            project_id: account.project_id.clone(),
            enabled: Some(account.enabled),
            is_invalid: account.is_invalid(),
            invalid_reason: account.invalid_reason.clone(),
            last_used: account.last_used,
            model_rate_limits: account.model_rate_limits.clone(),
            subscription: account.subscription.clone(),
            quota: account.quota.clone(),
        }
    }
}

/// Reads and writes the account store file. Writes are fire-and-forget;
/// the store tolerates a crash at any point and rebuilds caches from the
/// last persisted state.
#[derive(Debug, Clone)]
pub struct AccountStore {
    path: PathBuf,
}

impl AccountStore {
    /// Store backed by the given accounts file.
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Load all accounts. A missing file yields an empty pool.
    pub fn load(&self) -> anyhow::Result<Vec<Account>> {
        if !self.path.exists() {
            log::info!("No account store at {}; starting with an empty pool", self.path.display());
            return Ok(Vec::new());
        }

        let content = std::fs::read_to_string(&self.path)?;
        let stored: StoredAccounts = serde_json::from_str(&content)?;

        log::info!(
            "Loaded {} account(s) from {}",
            stored.accounts.len(),
            self.path.display()
        );

        Ok(stored.accounts.into_iter().map(Account::from).collect())
    }

    /// Persist a snapshot in the background. Without a runtime (shutdown
    /// paths, unit tests) the write happens inline.
    pub fn spawn_save(&self, accounts: Vec<Account>) {
        let path = self.path.clone();

        let write = move || {
            let stored = StoredAccounts {
                accounts: accounts.iter().map(StoredAccount::from).collect(),
            };

            let serialized = match serde_json::to_string_pretty(&stored) {
                Ok(serialized) => serialized,
                Err(e) => {
                    log::error!("Failed to serialize account store: {e}");
                    return;
                }
            };

            if let Some(parent) = path.parent()
                && let Err(e) = std::fs::create_dir_all(parent)
            {
                log::error!("Failed to create account store directory: {e}");
                return;
            }

            if let Err(e) = std::fs::write(&path, serialized) {
                log::error!("Failed to persist account store to {}: {e}", path.display());
            }
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(write);
            }
            Err(_) => write(),
        }
    }
}
