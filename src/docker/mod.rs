//! Container runtime collaborator.
//!
//! The sync engine only talks to the runtime through [`ContainerRuntime`]:
//! list the running containers, inspect one of them, and follow the
//! lifecycle event stream. The production implementation lives in
//! [`client`] and uses bollard.

pub mod client;

use async_trait::async_trait;
use futures_util::stream::BoxStream;

use crate::utils::remove_tag;

pub type Result<T> = std::result::Result<T, DockerError>;

/// Lifecycle events, in the order the runtime emitted them.
pub type EventStream = BoxStream<'static, Result<LifecycleEvent>>;

#[derive(Debug, thiserror::Error)]
pub enum DockerError {
    #[error("Cannot reach the container runtime: {0}")]
    Transport(String),
    #[error("Malformed response from the container runtime: {0}")]
    Protocol(String),
    #[error("Container {0} not found")]
    NotFound(String),
    #[error("Image {expected} does not match the container image {actual}")]
    NotTagged { expected: String, actual: String },
}

impl From<bollard::errors::Error> for DockerError {
    fn from(err: bollard::errors::Error) -> Self {
        use bollard::errors::Error;
        match err {
            Error::DockerResponseServerError {
                status_code: 404,
                message,
            } => DockerError::NotFound(message),
            Error::DockerResponseServerError {
                status_code,
                message,
            } => DockerError::Protocol(format!("status {status_code}: {message}")),
            err @ (Error::JsonDataError { .. } | Error::JsonSerdeError { .. }) => {
                DockerError::Protocol(err.to_string())
            }
            err => DockerError::Transport(err.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventStatus {
    Start,
    Restart,
    Stop,
    Die,
    Kill,
    Other,
}

impl From<&str> for EventStatus {
    fn from(action: &str) -> Self {
        match action {
            "start" => EventStatus::Start,
            "restart" => EventStatus::Restart,
            "stop" => EventStatus::Stop,
            "die" => EventStatus::Die,
            "kill" => EventStatus::Kill,
            _ => EventStatus::Other,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleEvent {
    pub container_id: String,
    pub status: EventStatus,
    pub image: String,
}

/// Point-in-time view of a container, as reported by the runtime.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerSnapshot {
    pub id: String,
    pub image: String,
    pub name: String,
    pub ip_address: String,
    pub running: bool,
    /// `KEY=VALUE` pairs from the container config.
    pub env: Vec<String>,
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Running containers only.
    async fn list_containers(&self) -> Result<Vec<ContainerSnapshot>>;

    /// Inspects `id`. A non-empty `expected_image` must match the container's
    /// configured image once tags are stripped, and replaces it in the snapshot.
    async fn fetch_container(&self, id: &str, expected_image: &str) -> Result<ContainerSnapshot>;

    fn events(&self) -> EventStream;
}

/// Checks that an event's image refers to the image the container runs.
///
/// Events for untagged builds report an image id instead of the repository,
/// those are rejected with [`DockerError::NotTagged`].
pub fn ensure_tagged(expected_image: &str, configured_image: &str) -> Result<()> {
    if expected_image.is_empty() || remove_tag(expected_image) == remove_tag(configured_image) {
        return Ok(());
    }
    Err(DockerError::NotTagged {
        expected: expected_image.to_string(),
        actual: configured_image.to_string(),
    })
}
