//! frame-echo: a length-prefixed TCP echo server
//!
//! Features:
//! - `[u32 BE length][payload]` framing, responses prefixed with
//!   "Server received: "
//! - One task per connection with a configurable session ceiling
//! - Graceful shutdown on Ctrl-C / SIGTERM with a bounded drain
//! - Configuration via CLI arguments, environment or TOML file

use frame_echo::{Config, DrainOutcome, Listener};
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("frame-echo: {e}");
            return ExitCode::FAILURE;
        }
    };

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let workers = config.workers.unwrap_or_else(num_cpus);
    info!(
        host = %config.host,
        port = config.port,
        workers,
        max_sessions = config.max_sessions,
        max_frame_size = config.max_frame_size,
        read_timeout_secs = config.read_timeout.as_secs(),
        drain_timeout_secs = config.drain_timeout.as_secs(),
        "Starting frame-echo server"
    );

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(workers)
        .thread_name("frame-echo-worker")
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "Failed to start runtime");
            return ExitCode::FAILURE;
        }
    };

    runtime.block_on(run(config))
}

async fn run(config: Config) -> ExitCode {
    let listener = match Listener::bind(config) {
        Ok(listener) => listener,
        Err(e) => {
            error!(error = %e, "Startup failed");
            eprintln!("frame-echo: {e}");
            return ExitCode::FAILURE;
        }
    };

    match listener.serve(shutdown_signal()).await {
        Ok(report) => {
            match report.outcome {
                DrainOutcome::Graceful => info!("All sessions drained"),
                DrainOutcome::Forced => info!(forced = report.forced, "Forced remaining sessions closed"),
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "Server stopped");
            eprintln!("frame-echo: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Resolves on Ctrl-C, or SIGTERM on Unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl-C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}
