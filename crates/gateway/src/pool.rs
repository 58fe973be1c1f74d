//! The account pool: selection, per-(account, model) rate-limit state,
//! sticky binding and cooldown accounting.
//!
//! All mutations go through one mutex; selection is O(n) in the number of
//! accounts. The pool owns the authoritative rate-limit state, external
//! readers get snapshots.

use std::{sync::Mutex, time::Duration};

use jiff::Timestamp;
use secrecy::SecretString;

use crate::account::{Account, AccountSource, AccountStore, RateLimitState};

/// Cooldown applied when a 429 carries no parseable reset time.
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(60);

/// Outcome of `pick_next`.
#[derive(Debug)]
pub enum Selection {
    /// An eligible account, snapshotted for the attempt.
    Account(SelectedAccount),
    /// Every account is limited for this model; the shortest time until one
    /// frees up. The caller decides whether to wait.
    Wait(Duration),
    /// No enabled, valid account exists at all.
    Empty,
}

/// Snapshot of the fields an attempt needs.
#[derive(Debug, Clone)]
pub struct SelectedAccount {
    /// Account identifier.
    pub email: String,
    /// Credential source.
    pub source: AccountSource,
    /// Refresh token for the token store.
    pub refresh_token: Option<SecretString>,
    /// Project id for the request envelope.
    pub project_id: Option<String>,
}

struct PoolInner {
    accounts: Vec<Account>,
    sticky: Option<(String, String)>,
}

/// Ordered set of accounts plus rate-limit bookkeeping.
pub struct AccountPool {
    inner: Mutex<PoolInner>,
    store: AccountStore,
}

impl AccountPool {
    /// Pool over the given accounts, persisting back to `store`.
    pub fn new(accounts: Vec<Account>, store: AccountStore) -> Self {
        Self {
            inner: Mutex::new(PoolInner {
                accounts,
                sticky: None,
            }),
            store,
        }
    }

    /// Number of accounts, regardless of state.
    pub fn len(&self) -> usize {
        self.lock().accounts.len()
    }

    /// Whether the pool has no accounts at all.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PoolInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Select the next account for `model`, preferring the sticky binding,
    /// otherwise round-robin by least-recent use. Expired rate-limit entries
    /// are cleared on the way.
    pub fn pick_next(&self, model: &str) -> Selection {
        self.pick_next_at(model, now_ms())
    }

    fn pick_next_at(&self, model: &str, now: i64) -> Selection {
        let mut inner = self.lock();

        for account in &mut inner.accounts {
            account
                .model_rate_limits
                .retain(|_, state| state.is_rate_limited && now < state.reset_epoch_ms);
        }

        let usable: Vec<usize> = inner
            .accounts
            .iter()
            .enumerate()
            .filter(|(_, account)| account.enabled && !account.is_invalid())
            .map(|(i, _)| i)
            .collect();

        if usable.is_empty() {
            return Selection::Empty;
        }

        let eligible: Vec<usize> = usable
            .iter()
            .copied()
            .filter(|&i| {
                inner.accounts[i]
                    .model_rate_limits
                    .get(model)
                    .is_none_or(|state| !state.is_rate_limited || now >= state.reset_epoch_ms)
            })
            .collect();

        if eligible.is_empty() {
            let min_reset = usable
                .iter()
                .filter_map(|&i| inner.accounts[i].model_rate_limits.get(model))
                .map(|state| state.reset_epoch_ms)
                .min()
                .unwrap_or(now);

            let wait_ms = (min_reset - now).max(0) as u64;
            return Selection::Wait(Duration::from_millis(wait_ms));
        }

        let picked = inner
            .sticky
            .as_ref()
            .filter(|(_, sticky_model)| sticky_model == model)
            .and_then(|(email, _)| {
                eligible
                    .iter()
                    .copied()
                    .find(|&i| inner.accounts[i].email == *email)
            })
            .unwrap_or_else(|| {
                // Round-robin by least-recent use; ties resolve to the
                // earliest account, which keeps the order stable.
                eligible
                    .iter()
                    .copied()
                    .min_by_key(|&i| inner.accounts[i].last_used)
                    .unwrap_or(eligible[0])
            });

        let account = &inner.accounts[picked];
        log::debug!("Selected account {} for model {model}", account.display_name());

        Selection::Account(SelectedAccount {
            email: account.email.clone(),
            source: account.source,
            refresh_token: account.refresh_token.clone(),
            project_id: account.effective_project().map(str::to_string),
        })
    }

    /// Record a 429 for (account, model). A missing reset defaults to the
    /// conservative cooldown.
    pub fn mark_rate_limited(&self, email: &str, model: &str, reset_after: Option<Duration>) {
        let reset_epoch_ms = now_ms() + reset_after.unwrap_or(DEFAULT_COOLDOWN).as_millis() as i64;

        {
            let mut inner = self.lock();

            if let Some(account) = inner.accounts.iter_mut().find(|account| account.email == email) {
                account.model_rate_limits.insert(
                    model.to_string(),
                    RateLimitState {
                        is_rate_limited: true,
                        reset_epoch_ms,
                    },
                );
                log::info!(
                    "Account {} rate-limited for {model} until epoch {reset_epoch_ms}",
                    account.display_name()
                );
            }

            if inner.sticky.as_ref().is_some_and(|(e, m)| e == email && m == model) {
                log::debug!("Sticky binding invalidated for {model}");
                inner.sticky = None;
            }
        }

        self.persist();
    }

    /// Optimistic retry: every account looks limited, so treat the
    /// accumulated state as stale and allow a fresh probe.
    pub fn reset_all_rate_limits(&self) {
        {
            let mut inner = self.lock();
            log::info!("Resetting rate-limit state for all accounts (optimistic retry)");

            for account in &mut inner.accounts {
                account.model_rate_limits.clear();
            }
        }

        self.persist();
    }

    /// Flag an account as unusable.
    pub fn mark_invalid(&self, email: &str, reason: &str) {
        {
            let mut inner = self.lock();

            if let Some(account) = inner.accounts.iter_mut().find(|account| account.email == email) {
                log::warn!("Account {} marked invalid: {reason}", account.display_name());
                account.invalid_reason = Some(reason.to_string());
            }

            if inner.sticky.as_ref().is_some_and(|(e, _)| e == email) {
                inner.sticky = None;
            }
        }

        self.persist();
    }

    /// Record a successful attempt: bumps `last_used` and sets the sticky
    /// binding to maximize upstream cache reuse.
    pub fn note_success(&self, email: &str, model: &str) {
        let mut inner = self.lock();

        if let Some(account) = inner.accounts.iter_mut().find(|account| account.email == email) {
            account.last_used = now_ms();
        }

        inner.sticky = Some((email.to_string(), model.to_string()));
    }

    /// Drop the sticky binding when a failure is attributed to it.
    pub fn invalidate_sticky(&self, email: &str, model: &str) {
        let mut inner = self.lock();

        if inner.sticky.as_ref().is_some_and(|(e, m)| e == email && m == model) {
            inner.sticky = None;
        }
    }

    /// Drop the cached project for an account, e.g. after UNAUTHENTICATED.
    pub fn clear_project(&self, email: &str) {
        let mut inner = self.lock();

        if let Some(account) = inner.accounts.iter_mut().find(|account| account.email == email) {
            account.project_id = None;
        }
    }

    /// Copy of the current account state for status endpoints.
    pub fn snapshot(&self) -> Vec<Account> {
        self.lock().accounts.clone()
    }

    fn persist(&self) {
        let snapshot = self.snapshot();
        self.store.spawn_save(snapshot);
    }
}

fn now_ms() -> i64 {
    Timestamp::now().as_millisecond()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::{Quota, Subscription};

    fn account(email: &str) -> Account {
        Account {
            email: email.to_string(),
            source: AccountSource::Oauth,
            refresh_token: Some(SecretString::from(format!("rt_{email}"))),
            project_id: Some(format!("projects/{email}")),
            enabled: true,
            invalid_reason: None,
            last_used: 0,
            model_rate_limits: Default::default(),
            subscription: Subscription::default(),
            quota: Quota::default(),
        }
    }

    fn pool(accounts: Vec<Account>) -> AccountPool {
        let dir = tempfile::tempdir().unwrap();
        let store = AccountStore::new(dir.path().join("accounts.json"));
        AccountPool::new(accounts, store)
    }

    fn picked_email(selection: Selection) -> String {
        match selection {
            Selection::Account(selected) => selected.email,
            other => unreachable!("expected an account, got {other:?}"),
        }
    }

    #[test]
    fn pick_excludes_invalid_and_disabled() {
        let mut bad = account("bad@example.com");
        bad.invalid_reason = Some("revoked".to_string());

        let mut off = account("off@example.com");
        off.enabled = false;

        let pool = pool(vec![bad, off, account("ok@example.com")]);

        assert_eq!(picked_email(pool.pick_next("claude-3-5-sonnet")), "ok@example.com");
    }

    #[test]
    fn pick_is_round_robin_by_last_used() {
        let mut first = account("first@example.com");
        first.last_used = 100;
        let mut second = account("second@example.com");
        second.last_used = 50;

        let pool = pool(vec![first, second]);

        assert_eq!(picked_email(pool.pick_next("m")), "second@example.com");
    }

    #[test]
    fn marked_account_is_excluded_until_reset() {
        let pool = pool(vec![account("a@example.com"), account("b@example.com")]);

        pool.mark_rate_limited("a@example.com", "claude-3-5-sonnet", Some(Duration::from_secs(1800)));

        assert_eq!(picked_email(pool.pick_next("claude-3-5-sonnet")), "b@example.com");

        // A different model is unaffected.
        let other = pool.pick_next("gemini-2.5-pro");
        assert!(matches!(other, Selection::Account(_)));
    }

    #[test]
    fn expired_limits_are_cleared_on_selection() {
        let mut limited = account("a@example.com");
        limited.model_rate_limits.insert(
            "m".to_string(),
            RateLimitState {
                is_rate_limited: true,
                reset_epoch_ms: now_ms() - 1000,
            },
        );

        let pool = pool(vec![limited]);

        assert_eq!(picked_email(pool.pick_next("m")), "a@example.com");
        assert!(pool.snapshot()[0].model_rate_limits.is_empty());
    }

    #[test]
    fn all_limited_returns_minimum_wait() {
        let pool = pool(vec![account("a@example.com"), account("b@example.com")]);

        pool.mark_rate_limited("a@example.com", "m", Some(Duration::from_secs(1800)));
        pool.mark_rate_limited("b@example.com", "m", Some(Duration::from_secs(10)));

        let Selection::Wait(wait) = pool.pick_next("m") else {
            unreachable!("expected a wait");
        };

        assert!(wait <= Duration::from_secs(10));
        assert!(wait > Duration::from_secs(8));
    }

    #[test]
    fn empty_when_no_usable_accounts() {
        let mut bad = account("bad@example.com");
        bad.invalid_reason = Some("revoked".to_string());

        let pool = pool(vec![bad]);

        assert!(matches!(pool.pick_next("m"), Selection::Empty));
    }

    #[test]
    fn sticky_binding_is_preferred_and_invalidated() {
        let mut first = account("first@example.com");
        first.last_used = 10;
        let mut second = account("second@example.com");
        second.last_used = 5;

        let pool = pool(vec![first, second]);

        // Round-robin would pick `second`, but a prior success on `first`
        // makes it sticky for this model.
        pool.note_success("first@example.com", "m");
        assert_eq!(picked_email(pool.pick_next("m")), "first@example.com");

        pool.invalidate_sticky("first@example.com", "m");
        assert_eq!(picked_email(pool.pick_next("m")), "second@example.com");
    }

    #[test]
    fn reset_all_clears_every_limit() {
        let pool = pool(vec![account("a@example.com")]);

        pool.mark_rate_limited("a@example.com", "m", None);
        assert!(matches!(pool.pick_next("m"), Selection::Wait(_)));

        pool.reset_all_rate_limits();
        assert!(matches!(pool.pick_next("m"), Selection::Account(_)));
    }

    #[tokio::test]
    async fn default_cooldown_applies_without_reset() {
        let pool = pool(vec![account("a@example.com")]);

        pool.mark_rate_limited("a@example.com", "m", None);

        let Selection::Wait(wait) = pool.pick_next("m") else {
            unreachable!("expected a wait");
        };
        assert!(wait <= DEFAULT_COOLDOWN);
        assert!(wait > DEFAULT_COOLDOWN - Duration::from_secs(5));
    }
}
