//! Cached access tokens with single-flight refresh and a proactive
//! background scheduler.

use std::{path::PathBuf, sync::Arc, time::Duration};

use dashmap::DashMap;
use jiff::Timestamp;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::{
    account::AccountSource,
    error::{GatewayError, GatewayResult},
    pool::{AccountPool, SelectedAccount},
};

const OAUTH_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";

// Public installed-app OAuth client; the secret is not confidential for
// this grant type.
const OAUTH_CLIENT_ID: &str = "681255809395-oo8ft2oprdrnp9e3aqf6av3hmdib135j.apps.googleusercontent.com";
const OAUTH_CLIENT_SECRET: &str = "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";

/// Tokens within this window of expiry are treated as stale.
const EXPIRY_SKEW: Duration = Duration::from_secs(60);

/// The scheduler refreshes tokens expiring within this window.
const PROACTIVE_WINDOW: Duration = Duration::from_secs(5 * 60);

/// Scheduler wake period.
const SCHEDULER_PERIOD: Duration = Duration::from_secs(45);

#[derive(Clone)]
struct TokenEntry {
    access_token: SecretString,
    expires_at_ms: i64,
}

/// Result of a forced refresh across the pool.
#[derive(Debug, Default, Serialize)]
pub struct RefreshSummary {
    /// Accounts whose token was refreshed.
    pub refreshed: usize,
    /// Accounts whose refresh failed.
    pub failed: usize,
}

/// Per-account access-token cache. The store is the only writer to its
/// entries; a failed refresh caches nothing, so the next call retries.
pub struct TokenStore {
    client: reqwest::Client,
    token_url: String,
    legacy_token_path: Option<PathBuf>,
    entries: DashMap<String, TokenEntry>,
    refresh_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

impl TokenStore {
    /// Store refreshing against the real OAuth endpoint.
    pub fn new(legacy_token_path: PathBuf) -> Self {
        Self::with_token_url(OAUTH_TOKEN_URL.to_string(), Some(legacy_token_path))
    }

    /// Store refreshing against an explicit token endpoint.
    pub fn with_token_url(token_url: String, legacy_token_path: Option<PathBuf>) -> Self {
        Self {
            client: reqwest::Client::new(),
            token_url,
            legacy_token_path,
            entries: DashMap::new(),
            refresh_locks: DashMap::new(),
        }
    }

    /// A usable access token for the account: cached while fresh, otherwise
    /// refreshed. Concurrent callers observing a miss share one refresh.
    pub async fn token_for(&self, account: &SelectedAccount) -> GatewayResult<SecretString> {
        if let Some(token) = self.fresh_token(&account.email) {
            return Ok(token);
        }

        let lock = self
            .refresh_locks
            .entry(account.email.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();

        let _guard = lock.lock().await;

        // A concurrent caller may have refreshed while we waited.
        if let Some(token) = self.fresh_token(&account.email) {
            return Ok(token);
        }

        let entry = match account.source {
            AccountSource::Oauth => self.refresh_oauth(account).await?,
            AccountSource::Legacy => self.read_legacy_token()?,
        };

        let token = entry.access_token.clone();
        self.entries.insert(account.email.clone(), entry);

        Ok(token)
    }

    /// Drop the cached token for an account.
    pub fn invalidate(&self, email: &str) {
        self.entries.remove(email);
    }

    /// Clear and re-fetch every usable account's token; legacy accounts are
    /// re-read best-effort.
    pub async fn force_refresh_all(&self, pool: &AccountPool) -> RefreshSummary {
        let mut summary = RefreshSummary::default();

        for account in pool.snapshot() {
            if !account.enabled || account.is_invalid() {
                continue;
            }

            self.invalidate(&account.email);

            let selected = SelectedAccount {
                email: account.email.clone(),
                source: account.source,
                refresh_token: account.refresh_token.clone(),
                project_id: account.effective_project().map(str::to_string),
            };

            match self.token_for(&selected).await {
                Ok(_) => summary.refreshed += 1,
                Err(e) => {
                    log::warn!("Forced refresh failed for {}: {e}", account.display_name());
                    summary.failed += 1;
                }
            }
        }

        summary
    }

    /// Background task refreshing tokens that expire within five minutes.
    /// Stops when the shutdown token fires.
    pub fn spawn_scheduler(self: &Arc<Self>, pool: Arc<AccountPool>, shutdown: CancellationToken) {
        let store = self.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        log::debug!("Token refresh scheduler stopped");
                        break;
                    }
                    _ = tokio::time::sleep(SCHEDULER_PERIOD) => {}
                }

                for account in pool.snapshot() {
                    if !account.enabled || account.is_invalid() {
                        continue;
                    }

                    let expiring = store
                        .entries
                        .get(&account.email)
                        .is_some_and(|entry| entry.expires_at_ms - now_ms() < PROACTIVE_WINDOW.as_millis() as i64);

                    if !expiring {
                        continue;
                    }

                    log::debug!("Proactively refreshing token for {}", account.display_name());
                    store.invalidate(&account.email);

                    let selected = SelectedAccount {
                        email: account.email.clone(),
                        source: account.source,
                        refresh_token: account.refresh_token.clone(),
                        project_id: account.effective_project().map(str::to_string),
                    };

                    if let Err(e) = store.token_for(&selected).await {
                        log::warn!("Proactive refresh failed for {}: {e}", account.display_name());
                    }
                }
            }
        });
    }

    fn fresh_token(&self, email: &str) -> Option<SecretString> {
        let entry = self.entries.get(email)?;

        if now_ms() + (EXPIRY_SKEW.as_millis() as i64) < entry.expires_at_ms {
            Some(entry.access_token.clone())
        } else {
            None
        }
    }

    async fn refresh_oauth(&self, account: &SelectedAccount) -> GatewayResult<TokenEntry> {
        #[derive(Deserialize)]
        struct TokenResponse {
            access_token: String,
            expires_in: i64,
        }

        let Some(refresh_token) = &account.refresh_token else {
            return Err(GatewayError::Authentication(format!(
                "account {} has no refresh token",
                account.email
            )));
        };

        log::debug!("Refreshing access token for {}", account.email);

        let response = self
            .client
            .post(&self.token_url)
            .form(&[
                ("client_id", OAUTH_CLIENT_ID),
                ("client_secret", OAUTH_CLIENT_SECRET),
                ("refresh_token", refresh_token.expose_secret()),
                ("grant_type", "refresh_token"),
            ])
            .send()
            .await
            .map_err(|e| GatewayError::Authentication(format!("token endpoint unreachable: {e}")))?;

        let status = response.status();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            log::warn!("Token refresh for {} failed with status {status}", account.email);

            return Err(GatewayError::Authentication(format!(
                "token refresh failed with status {status}: {body}"
            )));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| GatewayError::Authentication(format!("malformed token response: {e}")))?;

        Ok(TokenEntry {
            access_token: SecretString::from(token.access_token),
            expires_at_ms: now_ms() + token.expires_in * 1000,
        })
    }

    fn read_legacy_token(&self) -> GatewayResult<TokenEntry> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct LegacyToken {
            access_token: String,
            expires_at: i64,
        }

        let Some(path) = &self.legacy_token_path else {
            return Err(GatewayError::Authentication(
                "no legacy token source configured".to_string(),
            ));
        };

        let content = std::fs::read_to_string(path)
            .map_err(|e| GatewayError::Authentication(format!("cannot read legacy token: {e}")))?;

        let token: LegacyToken = serde_json::from_str(&content)
            .map_err(|e| GatewayError::Authentication(format!("malformed legacy token: {e}")))?;

        if token.expires_at <= now_ms() {
            return Err(GatewayError::Authentication("legacy token has expired".to_string()));
        }

        Ok(TokenEntry {
            access_token: SecretString::from(token.access_token),
            expires_at_ms: token.expires_at,
        })
    }
}

fn now_ms() -> i64 {
    Timestamp::now().as_millisecond()
}
