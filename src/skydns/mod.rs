//! Service registry collaborator.
//!
//! [`Registry`] is the narrow add/update/delete surface the registration
//! service writes through. [`client::SkydnsClient`] implements it against
//! the SkyDNS HTTP API.

pub mod client;

use async_trait::async_trait;

pub type Result<T> = std::result::Result<T, RegistryError>;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Service {0} is already registered")]
    Conflict(String),
    #[error("Service {0} is not registered")]
    NotFound(String),
    #[error("Cannot reach the registry: {0}")]
    Transport(String),
    #[error("Unexpected registry response: {0}")]
    Protocol(String),
}

/// Everything the registry needs to answer for one container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDescriptor {
    pub name: String,
    pub instance: String,
    pub host: String,
    pub environment: String,
    pub ttl_seconds: u32,
    pub port: u16,
}

impl ServiceDescriptor {
    /// `<instance>.<name>.<environment>.<domain>`, the most specific name
    /// the registry answers for this entry.
    pub fn dns_name(&self, domain: &str) -> String {
        format!(
            "{}.{}.{}.{}",
            self.instance, self.name, self.environment, domain
        )
    }
}

#[async_trait]
pub trait Registry: Send + Sync {
    /// Fails with [`RegistryError::Conflict`] when `key` already exists.
    async fn add(&self, key: &str, descriptor: &ServiceDescriptor) -> Result<()>;

    /// Fails with [`RegistryError::NotFound`] when `key` does not exist.
    async fn update(&self, key: &str, ttl_seconds: u32) -> Result<()>;

    /// Fails with [`RegistryError::NotFound`] when `key` does not exist.
    async fn delete(&self, key: &str) -> Result<()>;
}
