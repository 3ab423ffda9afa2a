//! Registration lifecycle engine.
//!
//! [`registration`] is the only writer of registry state, [`heartbeat`] owns
//! the set of keys under renewal, [`lifecycle`] holds the per-container start
//! and stop paths, and [`reconciler`] and [`dispatcher`] drive them from the
//! startup container list and the live event stream respectively.

pub mod dispatcher;
pub mod heartbeat;
pub mod lifecycle;
pub mod reconciler;
pub mod registration;

use std::fmt;

use crate::docker::DockerError;
use crate::plugins::DescriptorError;
use crate::skydns::RegistryError;
use crate::utils::truncate;

pub use dispatcher::EventDispatcher;
pub use heartbeat::HeartbeatManager;
pub use lifecycle::ContainerSync;
pub use reconciler::Reconciler;
pub use registration::RegistrationService;

/// Registry key of a container: a fixed-length prefix of its id.
///
/// Two containers whose ids share the prefix map to the same entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceKey(Box<str>);

impl ServiceKey {
    pub fn from_container_id(id: &str) -> Self {
        ServiceKey(truncate(id).into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Why handling one container failed. Never fatal to the process.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Docker(#[from] DockerError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Descriptor(#[from] DescriptorError),
}
