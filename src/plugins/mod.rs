//! Service descriptor derivation.
//!
//! A deriver turns a [`ContainerSnapshot`] into the [`ServiceDescriptor`]
//! written to the registry. It sees plain data only and has no access to the
//! runtime or the registry, so a static rule and a user template are
//! interchangeable.

pub mod template;

use std::path::Path;

use crate::docker::ContainerSnapshot;
use crate::skydns::ServiceDescriptor;
use crate::utils::{clean_image_name, remove_slash};

pub use template::TemplateDeriver;

/// Every service listens on this port unless a template says otherwise.
pub const DEFAULT_PORT: u16 = 80;

#[derive(Debug, thiserror::Error)]
pub enum DescriptorError {
    #[error("Invalid service descriptor for {container}: {reason}")]
    Invalid { container: String, reason: String },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Templating error in {field}: {source}")]
    Template {
        field: &'static str,
        source: minijinja::Error,
    },
}

impl DescriptorError {
    pub fn invalid(snapshot: &ContainerSnapshot, reason: impl Into<String>) -> Self {
        let container = if snapshot.name.is_empty() {
            snapshot.id.clone()
        } else {
            snapshot.name.clone()
        };
        DescriptorError::Invalid {
            container,
            reason: reason.into(),
        }
    }
}

/// Values a deriver falls back to when the container does not provide one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeriveDefaults {
    pub environment: String,
    pub ttl_seconds: u32,
}

pub trait DescriptorDeriver: Send + Sync {
    fn derive(&self, snapshot: &ContainerSnapshot) -> Result<ServiceDescriptor, DescriptorError>;
}

/// Names the service after its image and the instance after the container.
pub struct StaticDeriver {
    defaults: DeriveDefaults,
}

impl StaticDeriver {
    pub fn new(defaults: DeriveDefaults) -> Self {
        Self { defaults }
    }

    /// The descriptor before validation, also the base for template overrides.
    pub(crate) fn descriptor(&self, snapshot: &ContainerSnapshot) -> ServiceDescriptor {
        ServiceDescriptor {
            name: clean_image_name(&snapshot.image),
            instance: remove_slash(&snapshot.name),
            host: snapshot.ip_address.clone(),
            environment: self.defaults.environment.clone(),
            ttl_seconds: self.defaults.ttl_seconds,
            port: DEFAULT_PORT,
        }
    }
}

impl DescriptorDeriver for StaticDeriver {
    fn derive(&self, snapshot: &ContainerSnapshot) -> Result<ServiceDescriptor, DescriptorError> {
        validate(snapshot, self.descriptor(snapshot))
    }
}

/// Rejects descriptors the registry could not resolve.
pub(crate) fn validate(
    snapshot: &ContainerSnapshot,
    descriptor: ServiceDescriptor,
) -> Result<ServiceDescriptor, DescriptorError> {
    if descriptor.host.is_empty() {
        return Err(DescriptorError::invalid(snapshot, "missing host address"));
    }
    if descriptor.name.is_empty() {
        return Err(DescriptorError::invalid(snapshot, "missing service name"));
    }
    if descriptor.ttl_seconds == 0 {
        return Err(DescriptorError::invalid(snapshot, "ttl must be positive"));
    }
    Ok(descriptor)
}

/// The template deriver when a plugin file is configured, the static rule otherwise.
pub fn load(
    plugin: Option<&Path>,
    defaults: DeriveDefaults,
) -> Result<Box<dyn DescriptorDeriver>, DescriptorError> {
    match plugin {
        Some(path) => {
            log::info!("Loading descriptor plugin from {path:?}");
            Ok(Box::new(TemplateDeriver::from_file(path, defaults)?))
        }
        None => Ok(Box::new(StaticDeriver::new(defaults))),
    }
}
