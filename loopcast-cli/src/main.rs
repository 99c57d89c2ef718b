mod cli;
mod commands;
mod config;
mod logging;

use std::process;

use anyhow::Result;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::cli::{Args, Commands};

#[tokio::main(flavor = "current_thread")]
async fn main() {
    // Variables from .env feed the clap `env` fallbacks below.
    dotenvy::dotenv().ok();
    let args = Args::parse();

    if let Err(e) = run(args).await {
        error!("Application error: {e:#}");
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    let mut config = config::load(args.config.as_deref())?;
    let cancel = CancellationToken::new();

    match args.command {
        Commands::Stream(stream) => {
            let log_dir = stream.playlist.out_dir.join("logs");
            let _guard = logging::init_logging(Some(&log_dir), args.verbose, args.quiet)?;
            logging::start_retention_cleanup(log_dir, cancel.clone());
            spawn_signal_handler(cancel.clone());

            config::apply_stream_overrides(&mut config, &stream);
            info!(version = env!("CARGO_PKG_VERSION"), "Starting loopcast");
            commands::stream::run(stream, config, cancel).await
        }
        Commands::Probe(probe) => {
            logging::init_logging(None, args.verbose, args.quiet)?;
            commands::probe::run(probe, config).await
        }
    }
}

/// Cancel `cancel` on SIGINT or SIGTERM.
fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Shutdown signal received, stopping");
        cancel.cancel();
    });
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
