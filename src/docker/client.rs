//! Docker implementation of [`ContainerRuntime`] using bollard.

use std::collections::HashMap;

use async_trait::async_trait;
use bollard::Docker;
use bollard::models::{ContainerInspectResponse, ContainerSummary, EndpointSettings, EventMessage};
use bollard::query_parameters::{
    EventsOptions, InspectContainerOptions, InspectContainerOptionsBuilder, ListContainersOptions,
    ListContainersOptionsBuilder,
};
use futures_util::{StreamExt, stream};
use tokio::sync::mpsc;

use super::{
    ContainerRuntime, ContainerSnapshot, DockerError, EventStatus, EventStream, LifecycleEvent,
    Result, ensure_tagged,
};

/// Seconds bollard waits for a response before giving up.
const REQUEST_TIMEOUT: u64 = 120;

/// Preferred network when a container is attached to several.
const DEFAULT_BRIDGE: &str = "bridge";

#[derive(Clone)]
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connects to the daemon at `host`.
    ///
    /// Accepts a bare socket path, `unix://<path>`, `tcp://<addr>` or `http://<addr>`.
    pub fn connect(host: &str) -> Result<Self> {
        let docker = if let Some(addr) = host.strip_prefix("tcp://") {
            Docker::connect_with_http(
                &format!("http://{addr}"),
                REQUEST_TIMEOUT,
                bollard::API_DEFAULT_VERSION,
            )?
        } else if host.starts_with("http://") {
            Docker::connect_with_http(host, REQUEST_TIMEOUT, bollard::API_DEFAULT_VERSION)?
        } else {
            let path = host.strip_prefix("unix://").unwrap_or(host);
            Docker::connect_with_unix(path, REQUEST_TIMEOUT, bollard::API_DEFAULT_VERSION)?
        };
        log::debug!("Using container runtime at {host}");
        Ok(Self { docker })
    }

    /// Fails fast when the daemon is unreachable.
    pub async fn ping(&self) -> Result<()> {
        self.docker.ping().await?;
        Ok(())
    }
}

fn first_ip(networks: Option<&HashMap<String, EndpointSettings>>) -> String {
    let Some(networks) = networks else {
        return String::new();
    };
    networks
        .get(DEFAULT_BRIDGE)
        .into_iter()
        .chain(networks.values())
        .filter_map(|endpoint| endpoint.ip_address.clone())
        .find(|ip| !ip.is_empty())
        .unwrap_or_default()
}

fn snapshot_from_summary(summary: ContainerSummary) -> ContainerSnapshot {
    let name = summary
        .names
        .as_ref()
        .and_then(|names| names.first())
        .map(|name| name.trim_start_matches('/').to_string())
        .unwrap_or_default();
    let ip_address = first_ip(
        summary
            .network_settings
            .as_ref()
            .and_then(|settings| settings.networks.as_ref()),
    );
    ContainerSnapshot {
        id: summary.id.unwrap_or_default(),
        image: summary.image.unwrap_or_default(),
        name,
        ip_address,
        // Only running containers are listed
        running: true,
        env: Vec::new(),
    }
}

fn snapshot_from_inspect(info: ContainerInspectResponse) -> ContainerSnapshot {
    let config = info.config.unwrap_or_default();
    let ip_address = first_ip(
        info.network_settings
            .as_ref()
            .and_then(|settings| settings.networks.as_ref()),
    );
    ContainerSnapshot {
        id: info.id.unwrap_or_default(),
        image: config.image.unwrap_or_default(),
        name: info
            .name
            .map(|name| name.trim_start_matches('/').to_string())
            .unwrap_or_default(),
        ip_address,
        running: info.state.and_then(|state| state.running).unwrap_or(false),
        env: config.env.unwrap_or_default(),
    }
}

fn event_from_message(message: EventMessage) -> Result<LifecycleEvent> {
    let action = message.action.unwrap_or_default();
    let actor = message
        .actor
        .ok_or_else(|| DockerError::Protocol(format!("Event {action:?} has no actor")))?;
    let container_id = actor
        .id
        .ok_or_else(|| DockerError::Protocol(format!("Event {action:?} has no container id")))?;
    let image = actor
        .attributes
        .and_then(|mut attributes| attributes.remove("image"))
        .unwrap_or_default();

    Ok(LifecycleEvent {
        container_id,
        status: EventStatus::from(action.as_str()),
        image,
    })
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn list_containers(&self) -> Result<Vec<ContainerSnapshot>> {
        let options: ListContainersOptions = ListContainersOptionsBuilder::new().all(false).build();
        let containers = self.docker.list_containers(Some(options)).await?;
        Ok(containers.into_iter().map(snapshot_from_summary).collect())
    }

    async fn fetch_container(&self, id: &str, expected_image: &str) -> Result<ContainerSnapshot> {
        let options: InspectContainerOptions = InspectContainerOptionsBuilder::new().build();
        let info = self.docker.inspect_container(id, Some(options)).await?;

        let mut snapshot = snapshot_from_inspect(info);
        ensure_tagged(expected_image, &snapshot.image)?;
        if !expected_image.is_empty() {
            snapshot.image = expected_image.to_string();
        }
        Ok(snapshot)
    }

    fn events(&self) -> EventStream {
        let docker = self.docker.clone();
        let (tx, rx) = mpsc::channel(1);

        tokio::spawn(async move {
            let mut filters = HashMap::new();
            filters.insert("type".to_string(), vec!["container".to_string()]);
            let options = EventsOptions {
                filters: Some(filters),
                ..Default::default()
            };

            let mut messages = Box::pin(docker.events(Some(options)));
            while let Some(message) = messages.next().await {
                let item = message.map_err(DockerError::from).and_then(event_from_message);
                // A malformed message is passed on, anything else ends the stream
                let fatal = matches!(&item, Err(e) if !matches!(e, DockerError::Protocol(_)));
                if tx.send(item).await.is_err() || fatal {
                    break;
                }
            }
            log::debug!("Closing event stream");
        });

        stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed()
    }
}
