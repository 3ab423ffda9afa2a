use std::sync::Arc;

use crate::skydns::{Registry, RegistryError, ServiceDescriptor};

use super::ServiceKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterOutcome {
    Registered,
    /// The key was already registered, its TTL was renewed instead.
    AlreadyPresent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeregisterOutcome {
    Removed,
    NotFound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenewOutcome {
    Renewed,
    /// The entry is gone, usually evicted by the registry after its TTL.
    NotFound,
}

/// Conflict aware wrapper over the registry client.
///
/// Dispatcher workers and heartbeat loops race on the same keys, so a
/// conflicting add and a missing delete are both treated as success.
pub struct RegistrationService {
    registry: Arc<dyn Registry>,
    domain: String,
}

impl RegistrationService {
    pub fn new(registry: Arc<dyn Registry>, domain: impl Into<String>) -> Self {
        Self {
            registry,
            domain: domain.into(),
        }
    }

    pub async fn register(
        &self,
        key: &ServiceKey,
        descriptor: &ServiceDescriptor,
    ) -> Result<RegisterOutcome, RegistryError> {
        match self.registry.add(key.as_str(), descriptor).await {
            Ok(()) => {
                log::info!(
                    "Added {key} ({}) as {}",
                    descriptor.name,
                    descriptor.dns_name(&self.domain)
                );
                Ok(RegisterOutcome::Registered)
            }
            Err(RegistryError::Conflict(_)) => {
                log::info!("{key} ({}) is already registered, renewing", descriptor.name);
                match self.renew(key, descriptor.ttl_seconds).await? {
                    RenewOutcome::Renewed => Ok(RegisterOutcome::AlreadyPresent),
                    RenewOutcome::NotFound => {
                        // Removed between the add and the renew
                        self.registry.add(key.as_str(), descriptor).await?;
                        log::info!("Added {key} ({}) after it was removed", descriptor.name);
                        Ok(RegisterOutcome::Registered)
                    }
                }
            }
            Err(e) => Err(e),
        }
    }

    pub async fn deregister(&self, key: &ServiceKey) -> Result<DeregisterOutcome, RegistryError> {
        match self.registry.delete(key.as_str()).await {
            Ok(()) => {
                log::info!("Removed {key} from the registry");
                Ok(DeregisterOutcome::Removed)
            }
            Err(RegistryError::NotFound(_)) => {
                log::debug!("{key} was not registered, nothing to remove");
                Ok(DeregisterOutcome::NotFound)
            }
            Err(e) => Err(e),
        }
    }

    pub async fn renew(
        &self,
        key: &ServiceKey,
        ttl_seconds: u32,
    ) -> Result<RenewOutcome, RegistryError> {
        match self.registry.update(key.as_str(), ttl_seconds).await {
            Ok(()) => Ok(RenewOutcome::Renewed),
            Err(RegistryError::NotFound(_)) => Ok(RenewOutcome::NotFound),
            Err(e) => Err(e),
        }
    }
}
