//! User supplied descriptor templates.
//!
//! A plugin is a TOML file mapping descriptor fields to minijinja templates
//! written with `${ ... }` delimiters:
//!
//! ```toml
//! service = "${ container.env.DNS_SERVICE | default(clean_image_name(container.image)) }"
//! ttl = "${ container.env.DNS_TTL | default(default_ttl) }"
//! ```
//!
//! Templates see `container` (`id`, `image`, `name`, `ip_address`, `running`
//! and an `env` map), `default_ttl` and `default_environment`, plus the
//! `clean_image_name` and `remove_slash` helpers. Fields left out of the file
//! keep the value of the static rule.

use std::collections::BTreeMap;
use std::path::Path;

use minijinja::Environment;
use serde::{Deserialize, Serialize};

use super::{DescriptorDeriver, DescriptorError, DeriveDefaults, StaticDeriver, validate};
use crate::docker::ContainerSnapshot;
use crate::skydns::ServiceDescriptor;
use crate::utils::{clean_image_name, remove_slash};

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct PluginFile {
    pub service: Option<String>,
    pub instance: Option<String>,
    pub host: Option<String>,
    pub environment: Option<String>,
    pub ttl: Option<String>,
    pub port: Option<String>,
}

/// The view of a container exposed to templates.
#[derive(Serialize)]
struct TemplateContainer<'a> {
    id: &'a str,
    image: &'a str,
    name: &'a str,
    ip_address: &'a str,
    running: bool,
    env: BTreeMap<&'a str, &'a str>,
}

impl<'a> From<&'a ContainerSnapshot> for TemplateContainer<'a> {
    fn from(snapshot: &'a ContainerSnapshot) -> Self {
        let env = snapshot
            .env
            .iter()
            .map(|entry| entry.split_once('=').unwrap_or((entry.as_str(), "")))
            .collect();
        Self {
            id: &snapshot.id,
            image: &snapshot.image,
            name: &snapshot.name,
            ip_address: &snapshot.ip_address,
            running: snapshot.running,
            env,
        }
    }
}

pub struct TemplateDeriver {
    env: Environment<'static>,
    plugin: PluginFile,
    fallback: StaticDeriver,
    defaults: DeriveDefaults,
}

impl TemplateDeriver {
    pub fn from_file(path: &Path, defaults: DeriveDefaults) -> Result<Self, DescriptorError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content, defaults)
    }

    pub fn from_toml(content: &str, defaults: DeriveDefaults) -> Result<Self, DescriptorError> {
        let plugin: PluginFile = toml::from_str(content)?;
        Self::new(plugin, defaults)
    }

    pub fn new(plugin: PluginFile, defaults: DeriveDefaults) -> Result<Self, DescriptorError> {
        let mut env = Environment::new();

        let syntax = minijinja::syntax::SyntaxConfig::builder()
            .variable_delimiters("${", "}")
            .build()
            .map_err(|source| DescriptorError::Template {
                field: "syntax",
                source,
            })?;
        env.set_syntax(syntax);
        env.add_function("clean_image_name", |image: String| clean_image_name(&image));
        env.add_function("remove_slash", |name: String| remove_slash(&name));

        let deriver = Self {
            env,
            plugin,
            fallback: StaticDeriver::new(defaults.clone()),
            defaults,
        };

        // Surface syntax errors at startup instead of on the first event
        for (field, source) in deriver.fields() {
            if let Some(source) = source {
                deriver
                    .env
                    .template_from_str(source)
                    .map_err(|source| DescriptorError::Template { field, source })?;
            }
        }

        Ok(deriver)
    }

    fn fields(&self) -> [(&'static str, Option<&String>); 6] {
        [
            ("service", self.plugin.service.as_ref()),
            ("instance", self.plugin.instance.as_ref()),
            ("host", self.plugin.host.as_ref()),
            ("environment", self.plugin.environment.as_ref()),
            ("ttl", self.plugin.ttl.as_ref()),
            ("port", self.plugin.port.as_ref()),
        ]
    }

    fn render(
        &self,
        field: &'static str,
        source: Option<&String>,
        ctx: &minijinja::Value,
    ) -> Result<Option<String>, DescriptorError> {
        let Some(source) = source else {
            return Ok(None);
        };
        let rendered = self
            .env
            .render_str(source, ctx)
            .map_err(|source| DescriptorError::Template { field, source })?;
        Ok(Some(rendered.trim().to_string()))
    }
}

impl DescriptorDeriver for TemplateDeriver {
    fn derive(&self, snapshot: &ContainerSnapshot) -> Result<ServiceDescriptor, DescriptorError> {
        let ctx = minijinja::context! {
            container => TemplateContainer::from(snapshot),
            default_ttl => self.defaults.ttl_seconds,
            default_environment => self.defaults.environment.as_str(),
        };

        let mut descriptor = self.fallback.descriptor(snapshot);

        if let Some(name) = self.render("service", self.plugin.service.as_ref(), &ctx)? {
            descriptor.name = name;
        }
        if let Some(instance) = self.render("instance", self.plugin.instance.as_ref(), &ctx)? {
            descriptor.instance = instance;
        }
        if let Some(host) = self.render("host", self.plugin.host.as_ref(), &ctx)? {
            descriptor.host = host;
        }
        if let Some(environment) =
            self.render("environment", self.plugin.environment.as_ref(), &ctx)?
        {
            descriptor.environment = environment;
        }
        if let Some(ttl) = self.render("ttl", self.plugin.ttl.as_ref(), &ctx)? {
            descriptor.ttl_seconds = ttl.parse().map_err(|_| {
                DescriptorError::invalid(snapshot, format!("ttl {ttl:?} is not a number"))
            })?;
        }
        if let Some(port) = self.render("port", self.plugin.port.as_ref(), &ctx)? {
            descriptor.port = port.parse().map_err(|_| {
                DescriptorError::invalid(snapshot, format!("port {port:?} is not a valid port"))
            })?;
        }

        validate(snapshot, descriptor)
    }
}
