use std::{path::PathBuf, sync::OnceLock};

use clap::Parser;

/// Registers running Docker containers as SkyDNS services.
///
/// Every option can also be set through its environment variable or in the
/// file given with `--config`. Flags win over the file.
#[derive(Parser, Debug, Default)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Docker socket path or host URI (unix:// or tcp://).
    #[arg(short, long, env = "DOCKER_HOST")]
    pub socket: Option<String>,

    /// SkyDNS URL. Defaults to http://$SKYDNS_PORT_8080_TCP_ADDR:8080.
    #[arg(long, env = "SKYDNS_URL")]
    pub skydns: Option<String>,

    /// Shared secret sent to SkyDNS.
    #[arg(long, env = "SKYDNS_SECRET", hide_env_values = true)]
    pub secret: Option<String>,

    /// DNS domain the services are published under.
    #[arg(long, env = "SKYDOCK_DOMAIN")]
    pub domain: Option<String>,

    /// Environment recorded on every service.
    #[arg(long, env = "SKYDOCK_ENVIRONMENT")]
    pub environment: Option<String>,

    /// TTL in seconds for every registration.
    #[arg(long, env = "SKYDOCK_TTL")]
    pub ttl: Option<u32>,

    /// Seconds between renewals. 0 renews a quarter of the TTL early.
    #[arg(long, env = "SKYDOCK_BEAT")]
    pub beat: Option<u64>,

    /// Number of event workers.
    #[arg(long, env = "SKYDOCK_WORKERS")]
    pub workers: Option<usize>,

    /// Events buffered before the event reader blocks.
    #[arg(long, env = "SKYDOCK_QUEUE_SIZE")]
    pub queue_size: Option<usize>,

    /// Descriptor template file.
    #[arg(long, env = "SKYDOCK_PLUGINS")]
    pub plugins: Option<PathBuf>,

    /// Path to a TOML config file.
    #[arg(short, long, env = "SKYDOCK_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log filter used when RUST_LOG is not set.
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

static ARGS: OnceLock<Args> = OnceLock::new();

pub fn get_cli_args() -> &'static Args {
    ARGS.get_or_init(Args::parse)
}
