//! SkyDNS HTTP client.
//!
//! Services live under `/skydns/services/<key>`: `PUT` creates one, `PATCH`
//! refreshes its TTL and `DELETE` removes it. The shared secret, when
//! configured, travels in the `Authorization` header.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, StatusCode};
use serde::Serialize;
use url::Url;

use super::{Registry, RegistryError, Result, ServiceDescriptor};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Serialize)]
struct ServiceBody<'a> {
    #[serde(rename = "Name")]
    name: &'a str,
    #[serde(rename = "Version")]
    version: &'a str,
    #[serde(rename = "Environment")]
    environment: &'a str,
    #[serde(rename = "Host")]
    host: &'a str,
    #[serde(rename = "Port")]
    port: u16,
    #[serde(rename = "TTL")]
    ttl: u32,
}

impl<'a> From<&'a ServiceDescriptor> for ServiceBody<'a> {
    fn from(descriptor: &'a ServiceDescriptor) -> Self {
        Self {
            name: &descriptor.name,
            version: &descriptor.instance,
            environment: &descriptor.environment,
            host: &descriptor.host,
            port: descriptor.port,
            ttl: descriptor.ttl_seconds,
        }
    }
}

#[derive(Serialize)]
struct TtlBody {
    #[serde(rename = "TTL")]
    ttl: u32,
}

pub struct SkydnsClient {
    http: reqwest::Client,
    base: Url,
    secret: Option<String>,
}

impl SkydnsClient {
    pub fn new(mut base: Url, secret: Option<String>) -> Result<Self> {
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| RegistryError::Transport(e.to_string()))?;
        Ok(Self {
            http,
            base,
            secret: secret.filter(|s| !s.is_empty()),
        })
    }

    fn service_url(&self, key: &str) -> Result<Url> {
        self.base
            .join(&format!("skydns/services/{key}"))
            .map_err(|e| RegistryError::Protocol(format!("Invalid service url for {key}: {e}")))
    }

    fn request(&self, method: Method, key: &str) -> Result<RequestBuilder> {
        let request = self.http.request(method, self.service_url(key)?);
        Ok(match &self.secret {
            Some(secret) => request.header(reqwest::header::AUTHORIZATION, secret),
            None => request,
        })
    }

    async fn send(request: RequestBuilder) -> Result<StatusCode> {
        let response = request
            .send()
            .await
            .map_err(|e| RegistryError::Transport(e.to_string()))?;
        Ok(response.status())
    }
}

fn unexpected(operation: &str, key: &str, status: StatusCode) -> RegistryError {
    RegistryError::Protocol(format!("{operation} {key} returned {status}"))
}

#[async_trait]
impl Registry for SkydnsClient {
    async fn add(&self, key: &str, descriptor: &ServiceDescriptor) -> Result<()> {
        let request = self
            .request(Method::PUT, key)?
            .json(&ServiceBody::from(descriptor));
        match Self::send(request).await? {
            status if status.is_success() => Ok(()),
            StatusCode::CONFLICT => Err(RegistryError::Conflict(key.to_string())),
            status => Err(unexpected("add", key, status)),
        }
    }

    async fn update(&self, key: &str, ttl_seconds: u32) -> Result<()> {
        let request = self
            .request(Method::PATCH, key)?
            .json(&TtlBody { ttl: ttl_seconds });
        match Self::send(request).await? {
            status if status.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Err(RegistryError::NotFound(key.to_string())),
            status => Err(unexpected("update", key, status)),
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let request = self.request(Method::DELETE, key)?;
        match Self::send(request).await? {
            status if status.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Err(RegistryError::NotFound(key.to_string())),
            status => Err(unexpected("delete", key, status)),
        }
    }
}
