use std::sync::Arc;
use std::time::Duration;

use crate::docker::{ContainerRuntime, DockerError, EventStatus, LifecycleEvent};
use crate::plugins::DescriptorDeriver;

use super::heartbeat::{HeartbeatManager, default_beat};
use super::registration::{DeregisterOutcome, RegisterOutcome, RegistrationService};
use super::{ServiceKey, SyncError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Registered,
    AlreadyPresent,
    /// The event image does not name the container's image.
    NotTagged,
}

/// The start and stop paths shared by reconciliation and event handling.
pub struct ContainerSync {
    runtime: Arc<dyn ContainerRuntime>,
    deriver: Arc<dyn DescriptorDeriver>,
    registration: Arc<RegistrationService>,
    heartbeats: Arc<HeartbeatManager>,
    /// Fixed beat interval, derived from each descriptor's TTL when unset.
    beat: Option<Duration>,
}

impl ContainerSync {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        deriver: Arc<dyn DescriptorDeriver>,
        registration: Arc<RegistrationService>,
        heartbeats: Arc<HeartbeatManager>,
        beat: Option<Duration>,
    ) -> Self {
        Self {
            runtime,
            deriver,
            registration,
            heartbeats,
            beat,
        }
    }

    pub fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        &self.runtime
    }

    #[cfg(test)]
    pub fn heartbeats(&self) -> &Arc<HeartbeatManager> {
        &self.heartbeats
    }

    /// Registers `container_id` and makes sure its entry is being renewed.
    pub async fn start(&self, container_id: &str, image: &str) -> Result<StartOutcome, SyncError> {
        let snapshot = match self.runtime.fetch_container(container_id, image).await {
            Ok(snapshot) => snapshot,
            Err(DockerError::NotTagged { expected, actual }) => {
                log::debug!("Skipping {container_id}: {expected} is not tagged as {actual}");
                return Ok(StartOutcome::NotTagged);
            }
            Err(e) => return Err(e.into()),
        };

        let descriptor = self.deriver.derive(&snapshot)?;
        let key = ServiceKey::from_container_id(&snapshot.id);
        let outcome = self.registration.register(&key, &descriptor).await?;

        let beat = self.beat.unwrap_or_else(|| default_beat(descriptor.ttl_seconds));
        self.heartbeats.start(key, &descriptor, descriptor.ttl_seconds, beat);

        Ok(match outcome {
            RegisterOutcome::Registered => StartOutcome::Registered,
            RegisterOutcome::AlreadyPresent => StartOutcome::AlreadyPresent,
        })
    }

    /// Removes the entry. A running heartbeat notices on its next beat.
    pub async fn stop(&self, container_id: &str) -> Result<DeregisterOutcome, SyncError> {
        let key = ServiceKey::from_container_id(container_id);
        Ok(self.registration.deregister(&key).await?)
    }

    /// Handles one event, logging failures instead of returning them.
    pub async fn handle_event(&self, event: &LifecycleEvent) {
        let key = ServiceKey::from_container_id(&event.container_id);
        match event.status {
            EventStatus::Start | EventStatus::Restart => {
                if let Err(e) = self.start(&event.container_id, &event.image).await {
                    log::error!("Failed to register {key} ({}): {e}", event.image);
                }
            }
            EventStatus::Stop | EventStatus::Die | EventStatus::Kill => {
                if let Err(e) = self.stop(&event.container_id).await {
                    log::error!("Failed to remove {key} ({}): {e}", event.image);
                }
            }
            EventStatus::Other => {}
        }
    }
}
