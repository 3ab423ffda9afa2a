use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::cli::Args;
use crate::config::{ConfigError, Settings};
use crate::docker::client::DockerRuntime;
use crate::docker::{ContainerRuntime, DockerError};
use crate::plugins::{DescriptorDeriver, DescriptorError};
use crate::service::reconciler::ReconcileSummary;
use crate::service::{
    ContainerSync, EventDispatcher, HeartbeatManager, Reconciler, RegistrationService,
};
use crate::skydns::RegistryError;
use crate::skydns::client::SkydnsClient;

mod cli;
mod config;
mod docker;
mod plugins;
mod service;
mod signals;
mod skydns;
#[cfg(test)]
mod testing;
mod utils;

/// Wait before resubscribing after the event stream dropped.
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
enum FatalError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("Unable to register signal handlers: {0}")]
    Signals(#[from] std::io::Error),
    #[error("Unable to connect to Docker: {0}")]
    Docker(#[source] DockerError),
    #[error("Unable to create the SkyDNS client: {0}")]
    Registry(#[from] RegistryError),
    #[error("Unable to load the descriptor plugin: {0}")]
    Plugin(#[from] DescriptorError),
    #[error("Unable to list running containers: {0}")]
    Reconcile(#[source] DockerError),
    #[error("Docker event stream failed: {0}")]
    Events(#[source] DockerError),
}

#[tokio::main]
async fn main() -> ExitCode {
    // Load .env before parsing so it can provide flag values
    dotenv::dotenv().ok();
    let args = cli::get_cli_args();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&args.log_level))
        .init();

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: &Args) -> Result<(), FatalError> {
    let settings = Settings::resolve(args)?;

    let shutdown = CancellationToken::new();
    signals::handle_shutdown(shutdown.clone())?;

    let docker = DockerRuntime::connect(&settings.socket).map_err(FatalError::Docker)?;
    docker.ping().await.map_err(FatalError::Docker)?;
    log::info!("Connected to Docker at {}", settings.socket);
    let runtime: Arc<dyn ContainerRuntime> = Arc::new(docker);

    let registry = Arc::new(SkydnsClient::new(
        settings.skydns_url.clone(),
        settings.secret.clone(),
    )?);
    let deriver: Arc<dyn DescriptorDeriver> = Arc::from(plugins::load(
        settings.plugins.as_deref(),
        settings.derive_defaults(),
    )?);

    let registration = Arc::new(RegistrationService::new(registry, settings.domain.clone()));
    // Stopped only once the dispatcher drained
    let heartbeats = Arc::new(HeartbeatManager::new(
        Arc::clone(&runtime),
        Arc::clone(&registration),
        CancellationToken::new(),
    ));
    let sync = Arc::new(ContainerSync::new(
        Arc::clone(&runtime),
        deriver,
        registration,
        Arc::clone(&heartbeats),
        settings.beat,
    ));
    let reconciler = Reconciler::new(Arc::clone(&sync));
    let dispatcher = EventDispatcher::new(sync, settings.workers, settings.queue_size);

    // Subscribe before listing so no start is missed in between
    let mut events = runtime.events();
    let summary = reconciler.run().await.map_err(FatalError::Reconcile)?;
    log_summary(&summary);
    signals::notify_ready();

    let result = loop {
        match dispatcher.run(events, shutdown.clone()).await {
            Ok(()) => break Ok(()),
            Err(DockerError::Transport(reason)) => {
                log::warn!("Lost the Docker event stream: {reason}");
                log::info!("Reconnecting in {RECONNECT_DELAY:?}");
                tokio::select! {
                    _ = shutdown.cancelled() => break Ok(()),
                    _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                }
                events = runtime.events();
                match reconciler.run().await {
                    Ok(summary) => log_summary(&summary),
                    Err(e) => log::warn!("Reconciliation after reconnect failed: {e}"),
                }
            }
            Err(e) => break Err(FatalError::Events(e)),
        }
    };

    signals::notify_stopping();
    log::info!("Stopping {} heartbeats", heartbeats.running_count());
    heartbeats.shutdown().await;

    result
}

fn log_summary(summary: &ReconcileSummary) {
    log::info!(
        "Reconciled: {} registered, {} already present, {} skipped, {} failed",
        summary.registered,
        summary.already_present,
        summary.skipped,
        summary.failed
    );
}
