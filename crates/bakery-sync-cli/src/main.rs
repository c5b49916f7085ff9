mod commands;
mod config;
mod target;

use clap::Parser;
use tokio::signal;
use tokio::sync::watch as tokio_watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

use config::{Command, Config};
use target::Target;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = Config::parse();

    info!("bakery-sync {}", config.remote);
    let cache_dir = config.effective_cache_dir();
    info!("  Cache dir: {}", cache_dir.display());

    let target = Target::resolve(
        &config.remote,
        config.namespace.as_deref(),
        &cache_dir,
        config.s3_endpoint.clone(),
    )
    .await?;
    info!("  Namespace: '{}'", target.namespace.prefix());

    match &config.command {
        Command::Join => commands::join(&target, config.require_participant()?).await,
        Command::Pull => commands::pull(&target).await,
        Command::Push { force: true } => commands::force_push(&target).await,
        Command::Push { force: false } => {
            let participant = config.require_participant()?;
            let options = config.acquire_options().with_cancel(create_shutdown_signal());
            commands::push(&target, participant, options).await
        }
        Command::Status => commands::status(&target).await,
        Command::Release {
            participant_override,
        } => {
            let participant = match participant_override.as_deref() {
                Some(other) => other,
                None => config.require_participant()?,
            };
            commands::release_ticket(&target, participant).await
        }
        Command::Exec { command } => {
            let participant = config.require_participant()?;
            let options = config.acquire_options().with_cancel(create_shutdown_signal());
            commands::exec(&target, participant, options, command).await
        }
    }
}

/// Create a shutdown signal that triggers on Ctrl+C or SIGTERM.
/// A pending lock wait observes it and withdraws its ticket.
fn create_shutdown_signal() -> tokio_watch::Receiver<bool> {
    let (tx, rx) = tokio_watch::channel(false);

    tokio::spawn(async move {
        let ctrl_c = async {
            signal::ctrl_c()
                .await
                .expect("Failed to install Ctrl+C handler");
            info!("Received Ctrl+C, cancelling");
        };

        #[cfg(unix)]
        let terminate = async {
            signal::unix::signal(signal::unix::SignalKind::terminate())
                .expect("Failed to install SIGTERM handler")
                .recv()
                .await;
            info!("Received SIGTERM, cancelling");
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate => {},
        }

        let _ = tx.send(true);
    });

    rx
}
