//! The retry loop across accounts: sticky selection, cooldown waits,
//! optimistic reset and optional model fallback.
//!
//! Request lifecycle: NEW -> SELECTING -> CONNECTING -> STREAMING|RESPONDED,
//! with SELECTING -> WAITING -> SELECTING on cooldowns and CONNECTING ->
//! SELECTING on auth/rate/5xx classifications.

use std::{sync::Arc, time::Duration};

use config::FallbackConfig;
use futures::future::BoxFuture;

use crate::{
    error::{GatewayError, GatewayResult},
    messages::anthropic::MessagesRequest,
    pool::{AccountPool, Selection},
    token::TokenStore,
    upstream::{AttemptError, UpstreamClient, UpstreamReply},
};

/// Minimum number of attempts; pools larger than this get one attempt per
/// account plus one.
pub const MAX_RETRIES: usize = 3;

/// Longest cooldown the dispatcher will sleep through before giving up.
pub const MAX_WAIT_BEFORE_ERROR: Duration = Duration::from_secs(120);

/// Pause after a network-level failure before moving to the next account.
const NETWORK_PAUSE: Duration = Duration::from_secs(1);

/// Orchestrates retries across accounts and endpoint fallbacks.
pub struct Dispatcher {
    pool: Arc<AccountPool>,
    tokens: Arc<TokenStore>,
    upstream: UpstreamClient,
    fallback: FallbackConfig,
}

impl Dispatcher {
    /// Dispatcher over the given pool, token store and upstream client.
    pub fn new(pool: Arc<AccountPool>, tokens: Arc<TokenStore>, upstream: UpstreamClient, fallback: FallbackConfig) -> Self {
        Self {
            pool,
            tokens,
            upstream,
            fallback,
        }
    }

    /// Dispatch a validated request to the Cloud-Code pool.
    pub async fn dispatch(&self, request: MessagesRequest) -> GatewayResult<UpstreamReply> {
        self.dispatch_inner(request, true).await
    }

    fn dispatch_inner(&self, request: MessagesRequest, allow_fallback: bool) -> BoxFuture<'_, GatewayResult<UpstreamReply>> {
        Box::pin(async move {
            let budget = MAX_RETRIES.max(self.pool.len() + 1);

            let mut attempts = 0;
            let mut waits = 0;
            let mut did_optimistic_reset = false;
            let mut last_failure: Option<String> = None;

            loop {
                if attempts >= budget {
                    return Err(GatewayError::Overloaded(
                        last_failure.unwrap_or_else(|| "attempt budget exhausted".to_string()),
                    ));
                }

                match self.pool.pick_next(&request.model) {
                    Selection::Account(account) => {
                        attempts += 1;

                        let token = match self.tokens.token_for(&account).await {
                            Ok(token) => token,
                            Err(e) => {
                                log::warn!("Token refresh failed for {}: {e}", account.email);
                                self.pool.mark_invalid(&account.email, "token refresh failed");
                                last_failure = Some("token refresh failed".to_string());
                                continue;
                            }
                        };

                        match self
                            .upstream
                            .attempt(&self.pool, &self.tokens, &account, &token, &request)
                            .await
                        {
                            Ok(reply) => {
                                self.pool.note_success(&account.email, &request.model);
                                return Ok(reply);
                            }
                            Err(AttemptError::RateLimited { reset }) => {
                                // Already marked by the upstream client.
                                log::info!(
                                    "Account {} limited for {}; reset in {reset:?}",
                                    account.email,
                                    request.model
                                );
                                self.pool.invalidate_sticky(&account.email, &request.model);
                            }
                            Err(AttemptError::Auth(message)) => {
                                self.pool.invalidate_sticky(&account.email, &request.model);
                                last_failure = Some(message);
                            }
                            Err(AttemptError::Server(message)) => {
                                self.pool.invalidate_sticky(&account.email, &request.model);
                                last_failure = Some(message);
                            }
                            Err(AttemptError::Network(message)) => {
                                log::warn!("Network failure talking upstream for {}: {message}", account.email);
                                self.pool.invalidate_sticky(&account.email, &request.model);
                                last_failure = Some(message);
                                tokio::time::sleep(NETWORK_PAUSE).await;
                            }
                            Err(AttemptError::Permission(message)) => {
                                return Err(GatewayError::Permission(message));
                            }
                            Err(AttemptError::InvalidRequest(message)) => {
                                return Err(GatewayError::InvalidRequest(message));
                            }
                        }
                    }

                    Selection::Wait(wait) => {
                        if wait <= MAX_WAIT_BEFORE_ERROR && waits < budget {
                            waits += 1;
                            log::info!(
                                "All accounts limited for {}; waiting {wait:?} before re-selecting",
                                request.model
                            );
                            tokio::time::sleep(wait).await;
                            continue;
                        }

                        if !did_optimistic_reset {
                            // Accumulated limits may be stale; probe once
                            // with a clean slate before failing over.
                            did_optimistic_reset = true;
                            self.pool.reset_all_rate_limits();
                            continue;
                        }

                        if allow_fallback
                            && self.fallback.enabled
                            && let Some(fallback_model) = self.fallback.model_for(&request.model)
                        {
                            log::info!("Dispatching with fallback model {fallback_model} for {}", request.model);

                            let mut fallback_request = request.clone();
                            fallback_request.model = fallback_model.to_string();

                            return self.dispatch_inner(fallback_request, false).await;
                        }

                        return Err(GatewayError::QuotaExhausted(format!(
                            "every account is cooling down; retry in {}s",
                            wait.as_secs().max(1)
                        )));
                    }

                    Selection::Empty => {
                        return Err(GatewayError::Authentication(
                            "no enabled, valid account is available".to_string(),
                        ));
                    }
                }
            }
        })
    }
}
