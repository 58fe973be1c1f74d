use args::Args;
use clap::Parser;
use server::ServeConfig;
use tokio_util::sync::CancellationToken;

mod args;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => config::Config::load_from(path)?,
        None => config::Config::load()?,
    };

    let log_filter = args.log.clone().unwrap_or_else(|| {
        if config.server.debug {
            "debug".to_string()
        } else {
            "info".to_string()
        }
    });

    let listen_address = args.listen.unwrap_or(config.server.listen_address);

    let shutdown_signal = CancellationToken::new();
    spawn_signal_handler(shutdown_signal.clone());

    server::serve(ServeConfig {
        listen_address,
        config,
        shutdown_signal,
        log_filter,
        version: env!("CARGO_PKG_VERSION").to_string(),
        bound_addr_sender: None,
    })
    .await
}

fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                log::error!("Failed to listen for ctrl-c: {e}");
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(e) => log::error!("Failed to listen for SIGTERM: {e}"),
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {}
            _ = terminate => {}
        }

        shutdown.cancel();
    });
}
