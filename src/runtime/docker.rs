use super::ContainerRuntime;
use crate::error::Result;
use crate::types::{
    ContainerInfo, ExposedPort, Inventory, NetworkAttachment, NetworkInfo, PortProtocol, Trigger,
};
use async_trait::async_trait;
use bollard::container::ListContainersOptions;
use bollard::models::{ContainerSummary, Network, PortTypeEnum};
use bollard::network::ListNetworksOptions;
use bollard::system::EventsOptions;
use bollard::Docker;
use futures_util::stream::StreamExt;
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::sleep;

const RECONNECT_DELAY: Duration = Duration::from_secs(2);

const CONTAINER_ACTIONS: [&str; 6] = ["start", "die", "stop", "kill", "destroy", "rename"];
const NETWORK_ACTIONS: [&str; 2] = ["connect", "disconnect"];

pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connect to the local Docker daemon using default settings.
    /// This handles `DOCKER_HOST` and the unix socket on Linux.
    pub fn connect() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self { docker })
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn inventory(&self) -> Result<Inventory> {
        let networks = self
            .docker
            .list_networks(Some(ListNetworksOptions::<String>::default()))
            .await?;
        let opts = ListContainersOptions::<String> {
            all: false,
            ..Default::default()
        };
        let containers = self.docker.list_containers(Some(opts)).await?;

        Ok(Inventory {
            containers: containers.into_iter().filter_map(container_info).collect(),
            networks: networks.into_iter().filter_map(network_info).collect(),
        })
    }

    async fn monitor(&self, trigger_tx: mpsc::Sender<Trigger>) -> Result<()> {
        loop {
            let actions: Vec<String> = CONTAINER_ACTIONS
                .iter()
                .chain(NETWORK_ACTIONS.iter())
                .map(|s| s.to_string())
                .collect();
            let filters = HashMap::from([
                (
                    "type".to_string(),
                    vec!["container".to_string(), "network".to_string()],
                ),
                ("event".to_string(), actions),
            ]);
            let opts = EventsOptions::<String> {
                filters,
                ..Default::default()
            };

            let mut stream = self.docker.events(Some(opts));

            info!("Listening for Docker events...");
            while let Some(msg) = stream.next().await {
                let event = match msg {
                    Ok(event) => event,
                    Err(e) => {
                        error!("Error in Docker event stream: {}", e);
                        break; // Break inner loop to reconnect
                    }
                };
                let Some(actor) = event.actor else {
                    continue;
                };
                let attributes = actor.attributes.unwrap_or_default();
                // Network events carry the container id as an attribute.
                let container = attributes
                    .get("name")
                    .or_else(|| attributes.get("container"))
                    .cloned()
                    .or(actor.id)
                    .unwrap_or_default();
                let action = event.action.unwrap_or_default();
                debug!("Docker event: {} for {}", action, container);

                if trigger_tx
                    .send(Trigger::Container { action, container })
                    .await
                    .is_err()
                {
                    info!("Trigger channel closed, stopping Docker monitor");
                    return Ok(());
                }
            }

            warn!(
                "Docker event stream ended. Reconnecting in {}s...",
                RECONNECT_DELAY.as_secs()
            );
            sleep(RECONNECT_DELAY).await;
        }
    }
}

fn container_info(summary: ContainerSummary) -> Option<ContainerInfo> {
    let id = summary.id?;
    let ports = summary
        .ports
        .unwrap_or_default()
        .into_iter()
        .map(|port| ExposedPort {
            port: port.private_port,
            protocol: match port.typ {
                Some(PortTypeEnum::TCP) => PortProtocol::Tcp,
                Some(PortTypeEnum::UDP) => PortProtocol::Udp,
                _ => PortProtocol::Other,
            },
        })
        .collect();

    // Docker reports networks as a map; sort by name so "first bridge
    // network" means the same thing on every cycle.
    let mut networks: Vec<(String, NetworkAttachment)> = summary
        .network_settings
        .and_then(|settings| settings.networks)
        .unwrap_or_default()
        .into_iter()
        .filter_map(|(name, endpoint)| {
            let network_id = endpoint.network_id.filter(|id| !id.is_empty())?;
            let ip = endpoint
                .ip_address
                .filter(|ip| !ip.is_empty())
                .and_then(|ip| match ip.parse::<IpAddr>() {
                    Ok(ip) => Some(ip),
                    Err(e) => {
                        warn!("Container {} has invalid address {}: {}", id, ip, e);
                        None
                    }
                });
            Some((name, NetworkAttachment { network_id, ip }))
        })
        .collect();
    networks.sort_by(|a, b| a.0.cmp(&b.0));

    Some(ContainerInfo {
        id,
        names: summary.names.unwrap_or_default(),
        labels: summary.labels.unwrap_or_default(),
        ports,
        networks: networks.into_iter().map(|(_, attachment)| attachment).collect(),
    })
}

fn network_info(network: Network) -> Option<NetworkInfo> {
    Some(NetworkInfo {
        id: network.id?,
        driver: network.driver.unwrap_or_default(),
    })
}
