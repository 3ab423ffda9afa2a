use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use url::Url;

use crate::cli::Args;
use crate::plugins::DeriveDefaults;

pub const DEFAULT_SOCKET: &str = "/var/run/docker.sock";
pub const DEFAULT_ENVIRONMENT: &str = "dev";
pub const DEFAULT_TTL: u32 = 60;
pub const DEFAULT_WORKERS: usize = 10;
pub const DEFAULT_QUEUE_SIZE: usize = 100;

/// Set by Docker when SkyDNS is linked into our container.
const SKYDNS_LINK_ADDR: &str = "SKYDNS_PORT_8080_TCP_ADDR";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Unable to read {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Missing {0}")]
    Missing(&'static str),
    #[error("Invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
    #[error("Invalid SkyDNS URL {url:?}: {source}")]
    Url {
        url: String,
        source: url::ParseError,
    },
}

/// Same settings as the command line, all optional.
#[derive(Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct ConfigFile {
    pub socket: Option<String>,
    pub skydns: Option<String>,
    pub secret: Option<String>,
    pub domain: Option<String>,
    pub environment: Option<String>,
    pub ttl: Option<u32>,
    pub beat: Option<u64>,
    pub workers: Option<usize>,
    pub queue_size: Option<usize>,
    pub plugins: Option<PathBuf>,
}

impl ConfigFile {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(toml::from_str(&content)?)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub socket: String,
    pub skydns_url: Url,
    pub secret: Option<String>,
    pub domain: String,
    pub environment: String,
    pub ttl_seconds: u32,
    /// `None` derives the beat from each service's TTL.
    pub beat: Option<Duration>,
    pub workers: usize,
    pub queue_size: usize,
    pub plugins: Option<PathBuf>,
}

impl Settings {
    /// Reads the config file named by `args`, if any, and merges it with the
    /// flags and the process environment.
    pub fn resolve(args: &Args) -> Result<Self, ConfigError> {
        let file = match &args.config {
            Some(path) => ConfigFile::from_file(path)?,
            None => ConfigFile::default(),
        };
        Self::merge(args, file, std::env::var(SKYDNS_LINK_ADDR).ok())
    }

    pub fn merge(
        args: &Args,
        file: ConfigFile,
        skydns_link: Option<String>,
    ) -> Result<Self, ConfigError> {
        let domain = args
            .domain
            .clone()
            .or(file.domain)
            .filter(|domain| !domain.trim().is_empty())
            .ok_or(ConfigError::Missing("domain (--domain)"))?;

        let skydns = args
            .skydns
            .clone()
            .or(file.skydns)
            .or_else(|| {
                skydns_link
                    .filter(|addr| !addr.is_empty())
                    .map(|addr| format!("http://{addr}:8080"))
            })
            .ok_or(ConfigError::Missing(
                "SkyDNS URL (--skydns or SKYDNS_PORT_8080_TCP_ADDR)",
            ))?;
        let skydns_url = Url::parse(&skydns).map_err(|source| ConfigError::Url {
            url: skydns.clone(),
            source,
        })?;
        if !matches!(skydns_url.scheme(), "http" | "https") {
            return Err(ConfigError::Invalid {
                field: "skydns",
                reason: format!("unsupported scheme {}", skydns_url.scheme()),
            });
        }

        let ttl_seconds = args.ttl.or(file.ttl).unwrap_or(DEFAULT_TTL);
        if ttl_seconds == 0 {
            return Err(ConfigError::Invalid {
                field: "ttl",
                reason: "must be at least 1 second".to_string(),
            });
        }

        // A beat past the TTL lets entries expire between renewals
        let beat = match args.beat.or(file.beat).unwrap_or(0) {
            0 => None,
            seconds if seconds > u64::from(ttl_seconds) => {
                return Err(ConfigError::Invalid {
                    field: "beat",
                    reason: format!("{seconds}s exceeds the {ttl_seconds}s TTL"),
                });
            }
            seconds => Some(Duration::from_secs(seconds)),
        };

        let workers = args.workers.or(file.workers).unwrap_or(DEFAULT_WORKERS);
        if workers == 0 {
            return Err(ConfigError::Invalid {
                field: "workers",
                reason: "must be at least 1".to_string(),
            });
        }

        let queue_size = args
            .queue_size
            .or(file.queue_size)
            .unwrap_or(DEFAULT_QUEUE_SIZE);
        if queue_size == 0 {
            return Err(ConfigError::Invalid {
                field: "queue-size",
                reason: "must be at least 1".to_string(),
            });
        }

        Ok(Self {
            socket: args
                .socket
                .clone()
                .or(file.socket)
                .unwrap_or_else(|| DEFAULT_SOCKET.to_string()),
            skydns_url,
            secret: args
                .secret
                .clone()
                .or(file.secret)
                .filter(|secret| !secret.is_empty()),
            domain,
            environment: args
                .environment
                .clone()
                .or(file.environment)
                .unwrap_or_else(|| DEFAULT_ENVIRONMENT.to_string()),
            ttl_seconds,
            beat,
            workers,
            queue_size,
            plugins: args.plugins.clone().or(file.plugins),
        })
    }

    pub fn derive_defaults(&self) -> DeriveDefaults {
        DeriveDefaults {
            environment: self.environment.clone(),
            ttl_seconds: self.ttl_seconds,
        }
    }
}
