use std::sync::Arc;

use tokio::task::JoinSet;

use crate::docker::DockerError;

use super::ServiceKey;
use super::lifecycle::{ContainerSync, StartOutcome};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub registered: usize,
    pub already_present: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Brings the registry in line with the containers already running.
pub struct Reconciler {
    sync: Arc<ContainerSync>,
}

impl Reconciler {
    pub fn new(sync: Arc<ContainerSync>) -> Self {
        Self { sync }
    }

    /// Runs the start path for every running container.
    ///
    /// Only failing to list the containers is an error, single containers
    /// that fail are logged and counted.
    pub async fn run(&self) -> Result<ReconcileSummary, DockerError> {
        let containers = self.sync.runtime().list_containers().await?;
        log::info!("Reconciling {} running containers", containers.len());

        let mut join_set = JoinSet::new();
        for container in containers {
            let sync = Arc::clone(&self.sync);
            join_set.spawn(async move {
                let result = sync.start(&container.id, &container.image).await;
                (container, result)
            });
        }

        let mut summary = ReconcileSummary::default();
        while let Some(result) = join_set.join_next().await {
            match result {
                Ok((_, Ok(StartOutcome::Registered))) => summary.registered += 1,
                Ok((_, Ok(StartOutcome::AlreadyPresent))) => summary.already_present += 1,
                Ok((_, Ok(StartOutcome::NotTagged))) => summary.skipped += 1,
                Ok((container, Err(e))) => {
                    let key = ServiceKey::from_container_id(&container.id);
                    log::warn!("Failed to register {key} ({}): {e}", container.image);
                    summary.failed += 1;
                }
                Err(e) => {
                    log::error!("Task join error: {e}");
                    summary.failed += 1;
                }
            }
        }

        Ok(summary)
    }
}
