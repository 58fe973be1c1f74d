//! Listener assembly: builds the gateway router, stacks the security-header
//! layers, binds the listener and drives graceful shutdown. Reusable from
//! the binary and from integration tests.

#![deny(missing_docs)]

mod headers;
mod logger;

use std::{net::SocketAddr, time::Duration};

use anyhow::anyhow;
use config::Config;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Bound on draining in-flight requests after the shutdown signal.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Configuration for serving the proxy.
pub struct ServeConfig {
    /// The socket address to bind.
    pub listen_address: SocketAddr,
    /// The resolved proxy configuration.
    pub config: Config,
    /// Cancellation token for graceful shutdown.
    pub shutdown_signal: CancellationToken,
    /// Log filter string, e.g. "info" or "gateway=debug".
    pub log_filter: String,
    /// Version string logged on startup.
    pub version: String,
    /// Optional oneshot sender for the bound address (useful with port 0).
    pub bound_addr_sender: Option<tokio::sync::oneshot::Sender<SocketAddr>>,
}

/// Start and run the proxy with the provided configuration.
pub async fn serve(
    ServeConfig {
        listen_address,
        config,
        shutdown_signal,
        log_filter,
        version,
        bound_addr_sender,
    }: ServeConfig,
) -> anyhow::Result<()> {
    logger::init(&log_filter);

    log::info!("antigravity-proxy {version}");

    let router = gateway::build(config, shutdown_signal.clone())
        .map_err(|e| anyhow!("Failed to initialize the gateway: {e}"))?;

    let app = headers::apply(router);

    let listener = TcpListener::bind(listen_address)
        .await
        .map_err(|e| anyhow!("Failed to bind to {listen_address}: {e}"))?;

    let bound = listener.local_addr()?;

    if let Some(sender) = bound_addr_sender
        && sender.send(bound).is_err()
    {
        log::warn!("Bound-address receiver dropped before startup completed");
    }

    log::info!("Anthropic-compatible endpoint: http://{bound}/v1/messages");

    let drain = shutdown_signal.clone();
    let server = axum::serve(listener, app.into_make_service()).with_graceful_shutdown(async move {
        drain.cancelled().await;
        log::info!("Received shutdown signal, draining in-flight requests...");
    });

    tokio::select! {
        result = server => {
            result.map_err(|e| anyhow!("Server error: {e}"))?;
        }
        _ = async {
            shutdown_signal.cancelled().await;
            tokio::time::sleep(SHUTDOWN_GRACE).await;
        } => {
            log::warn!("Drain deadline reached, closing remaining connections");
        }
    }

    Ok(())
}
