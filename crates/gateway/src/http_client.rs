use std::time::Duration;

use reqwest::Client;

/// Shared HTTP client defaults for upstream calls. The short pool idle
/// timeout forces connection refresh so DNS changes on the endpoint fallback
/// list are picked up.
pub(crate) fn default_http_client() -> Client {
    Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .pool_idle_timeout(Some(Duration::from_secs(5)))
        .tcp_nodelay(true)
        .tcp_keepalive(Some(Duration::from_secs(60)))
        .build()
        .unwrap_or_default()
}
