//! BlobVault server binary
//!
//! Parses flags, builds a multi-thread runtime sized to the worker pool and
//! serves until a client sends `BYE` or the process gets Ctrl+C.

use blobvault::{ServerArgs, VaultServer};
use clap::Parser;
use std::process::ExitCode;
use tracing::{error, info, warn};

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

fn main() -> ExitCode {
    init_tracing();

    let config = match ServerArgs::parse().into_config() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Invalid configuration");
            return ExitCode::FAILURE;
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.workers)
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "Failed to start runtime");
            return ExitCode::FAILURE;
        }
    };

    let result = runtime.block_on(async move {
        let server = VaultServer::bind(config).await?;

        // Setup graceful shutdown on SIGINT (Ctrl+C)
        let token = server.shutdown_handle();
        tokio::spawn(async move {
            tokio::select! {
                signal = tokio::signal::ctrl_c() => {
                    if let Err(e) = signal {
                        warn!(error = %e, "Failed to listen for Ctrl+C");
                        return;
                    }
                    info!("Received Ctrl+C, initiating graceful shutdown");
                    token.cancel();
                }
                _ = token.cancelled() => {}
            }
        });

        server.run().await
    });

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Server stopped with an error");
            ExitCode::FAILURE
        }
    }
}
