use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use convoy_executor::application::Application;
use convoy_executor::config::ExecutorConfig;
use convoy_executor::metrics;

#[derive(Parser, Debug)]
#[command(name = "convoy-executor")]
#[command(about = "Executor agent brokering batch jobs onto a Kubernetes cluster")]
struct Args {
    /// Fully qualified path to the application configuration file
    #[arg(long)]
    config: Option<PathBuf>,
}

/// Resolves once SIGINT or SIGTERM arrives.
async fn shutdown_signal() {
    let mut sigterm = signal(SignalKind::terminate()).expect("SIGTERM handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("SIGINT handler");

    let received = tokio::select! {
        _ = sigterm.recv() => "SIGTERM",
        _ = sigint.recv() => "SIGINT",
    };
    tracing::info!(signal = received, "Shutdown requested, draining executor");
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let config = match args.config {
        Some(path) => match ExecutorConfig::load(&path) {
            Ok(config) => config,
            Err(e) => {
                tracing::error!(error = %e, "Failed to load configuration");
                return ExitCode::FAILURE;
            }
        },
        None => ExecutorConfig::default(),
    };

    // One token drives every subsystem: the signal listener cancels it, the
    // task manager, event reporter, and metrics endpoint all drain off it.
    let shutdown = CancellationToken::new();
    let signal_listener = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        signal_listener.cancel();
    });

    if let Err(e) = metrics::serve_metrics(config.metric.port, shutdown.clone()).await {
        tracing::error!(error = %e, "Failed to start metrics endpoint");
        return ExitCode::FAILURE;
    }

    let application = match Application::start(config, shutdown.clone()).await {
        Ok(application) => application,
        Err(e) => {
            tracing::error!(error = %e, "Startup failed");
            return ExitCode::FAILURE;
        }
    };

    shutdown.cancelled().await;
    application.shutdown().await;
    ExitCode::SUCCESS
}
