//! Mapping of a container inventory onto endpoint proposals.
//!
//! Nothing in here talks to Docker or to the registry: the same inventory
//! always yields the same proposals.

use std::collections::HashMap;
use std::net::IpAddr;

use crate::normalize::{normalize_name, strip_replica_suffix};
use crate::registry::load_balancer_alias;
use crate::types::{ContainerInfo, Inventory, NetworkInfo, PortProtocol};

pub const COMPOSE_PROJECT_LABEL: &str = "com.docker.compose.project";
pub const COMPOSE_SERVICE_LABEL: &str = "com.docker.compose.service";

/// Ports commonly serving HTTP, in order of preference.
pub const DEFAULT_HTTP_PORTS: [u16; 7] = [80, 8080, 8000, 8010, 443, 3000, 15672];

const BRIDGE_DRIVER: &str = "bridge";

#[derive(Debug, Clone)]
pub struct DiscoverySettings {
    pub tld: String,
    pub http_ports: Vec<u16>,
}

impl DiscoverySettings {
    pub fn new(tld: &str) -> Self {
        Self {
            tld: tld.to_string(),
            http_ports: DEFAULT_HTTP_PORTS.to_vec(),
        }
    }
}

/// A candidate endpoint derived from one container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Proposal {
    pub container_id: String,
    /// Normalized primary container name.
    pub container_name: String,
    /// Every name the container should answer to, primary first.
    pub names: Vec<String>,
    /// Address on the first bridge network.
    pub ip: Option<IpAddr>,
    pub http_port: Option<u16>,
    /// Ids of all networks the container is attached to.
    pub networks: Vec<String>,
}

impl Proposal {
    /// A proposal without an address or without any usable name cannot
    /// become an endpoint.
    pub fn is_complete(&self) -> bool {
        self.ip.is_some() && !self.names.is_empty()
    }
}

/// Derive one proposal per container in `inventory`.
pub fn propose(inventory: &Inventory, settings: &DiscoverySettings) -> Vec<Proposal> {
    let networks: HashMap<&str, &NetworkInfo> = inventory
        .networks
        .iter()
        .map(|network| (network.id.as_str(), network))
        .collect();

    inventory
        .containers
        .iter()
        .map(|container| propose_container(container, &networks, settings))
        .collect()
}

fn propose_container(
    container: &ContainerInfo,
    networks: &HashMap<&str, &NetworkInfo>,
    settings: &DiscoverySettings,
) -> Proposal {
    let http_port = infer_http_port(container, &settings.http_ports);

    let mut derived = Vec::new();
    for name in &container.names {
        let normalized = normalize_name(name);
        if normalized.is_empty() {
            continue;
        }
        if let Some(stem) = strip_replica_suffix(&normalized) {
            let stem = stem.to_string();
            derived.push(normalized);
            derived.push(stem);
        } else {
            derived.push(normalized);
        }
    }

    let project = container.labels.get(COMPOSE_PROJECT_LABEL);
    let service = container.labels.get(COMPOSE_SERVICE_LABEL);
    if let (Some(project), Some(service)) = (project, service) {
        let compose = normalize_name(&format!("{service}.{project}"));
        if !compose.is_empty() {
            derived.push(compose);
        }
    }

    let tld = settings.tld.as_str();
    let mut names: Vec<String> = Vec::new();
    let mut push = |name: String| {
        if !names.contains(&name) {
            names.push(name);
        }
    };
    for name in &derived {
        push(format!("{name}.{tld}"));
    }
    for name in &derived {
        push(name.clone());
    }
    if http_port.is_some() {
        for name in &derived {
            if let Some(alias) = load_balancer_alias(name, tld) {
                push(alias);
            }
        }
    }

    let container_name = container
        .names
        .iter()
        .map(|name| normalize_name(name))
        .find(|name| !name.is_empty())
        .unwrap_or_else(|| container.id.clone());

    Proposal {
        container_id: container.id.clone(),
        container_name,
        names,
        ip: bridge_ip(container, networks),
        http_port,
        networks: container
            .networks
            .iter()
            .map(|attachment| attachment.network_id.clone())
            .collect(),
    }
}

/// The first port of `preferred` that the container exposes over TCP.
fn infer_http_port(container: &ContainerInfo, preferred: &[u16]) -> Option<u16> {
    preferred.iter().copied().find(|candidate| {
        container
            .ports
            .iter()
            .any(|exposed| exposed.protocol == PortProtocol::Tcp && exposed.port == *candidate)
    })
}

/// Address on the first attached network driven by `bridge`.
fn bridge_ip(container: &ContainerInfo, networks: &HashMap<&str, &NetworkInfo>) -> Option<IpAddr> {
    container
        .networks
        .iter()
        .find(|attachment| {
            networks
                .get(attachment.network_id.as_str())
                .is_some_and(|network| network.driver == BRIDGE_DRIVER)
        })
        .and_then(|attachment| attachment.ip)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ExposedPort, NetworkAttachment};

    fn network(id: &str, driver: &str) -> NetworkInfo {
        NetworkInfo {
            id: id.into(),
            driver: driver.into(),
        }
    }

    fn attachment(network_id: &str, ip: &str) -> NetworkAttachment {
        NetworkAttachment {
            network_id: network_id.into(),
            ip: Some(ip.parse().unwrap()),
        }
    }

    fn shop_api() -> ContainerInfo {
        ContainerInfo {
            id: "abc123".into(),
            names: vec!["/api-1".into()],
            labels: HashMap::from([
                (COMPOSE_PROJECT_LABEL.to_string(), "shop".to_string()),
                (COMPOSE_SERVICE_LABEL.to_string(), "api".to_string()),
            ]),
            ports: vec![ExposedPort::tcp(8080)],
            networks: vec![attachment("net-bridge", "172.18.0.5")],
        }
    }

    fn inventory(containers: Vec<ContainerInfo>) -> Inventory {
        Inventory {
            containers,
            networks: vec![network("net-bridge", "bridge"), network("net-overlay", "overlay")],
        }
    }

    #[test]
    fn compose_container_gets_all_derived_names() {
        let proposals = propose(&inventory(vec![shop_api()]), &DiscoverySettings::new("cnt.local"));
        assert_eq!(proposals.len(), 1);

        let proposal = &proposals[0];
        assert_eq!(proposal.container_id, "abc123");
        assert_eq!(proposal.container_name, "api-1");
        assert_eq!(proposal.ip, Some("172.18.0.5".parse().unwrap()));
        assert_eq!(proposal.http_port, Some(8080));
        assert_eq!(
            proposal.names,
            vec![
                "api-1.cnt.local",
                "api.cnt.local",
                "api.shop.cnt.local",
                "api-1",
                "api",
                "api.shop",
                "api-1.lb.cnt.local",
                "api.lb.cnt.local",
                "api.shop.lb.cnt.local",
            ]
        );
    }

    #[test]
    fn first_preferred_port_wins_regardless_of_exposure_order() {
        let mut container = shop_api();
        container.ports = vec![
            ExposedPort::tcp(3000),
            ExposedPort::tcp(8080),
            ExposedPort::tcp(80),
        ];
        let proposals = propose(&inventory(vec![container]), &DiscoverySettings::new("cnt.local"));
        assert_eq!(proposals[0].http_port, Some(80));
    }

    #[test]
    fn udp_ports_and_unknown_ports_mean_dns_only() {
        let mut container = shop_api();
        container.ports = vec![
            ExposedPort {
                port: 80,
                protocol: PortProtocol::Udp,
            },
            ExposedPort::tcp(5432),
        ];
        let proposals = propose(&inventory(vec![container]), &DiscoverySettings::new("cnt.local"));
        assert_eq!(proposals[0].http_port, None);
        assert!(proposals[0].names.iter().all(|n| !n.contains(".lb.")));
    }

    #[test]
    fn ip_comes_from_first_bridge_network() {
        let mut container = shop_api();
        container.networks = vec![
            attachment("net-overlay", "10.0.1.7"),
            attachment("net-bridge", "172.18.0.9"),
        ];
        let proposals = propose(&inventory(vec![container]), &DiscoverySettings::new("cnt.local"));
        assert_eq!(proposals[0].ip, Some("172.18.0.9".parse().unwrap()));
        assert_eq!(proposals[0].networks, vec!["net-overlay", "net-bridge"]);
    }

    #[test]
    fn container_without_bridge_network_is_incomplete() {
        let mut container = shop_api();
        container.networks = vec![attachment("net-overlay", "10.0.1.7")];
        let proposals = propose(&inventory(vec![container]), &DiscoverySettings::new("cnt.local"));
        assert!(!proposals[0].is_complete());
        assert!(!proposals[0].names.is_empty());
    }

    #[test]
    fn container_without_usable_name_is_incomplete() {
        let container = ContainerInfo {
            id: "f00d".into(),
            names: vec!["/_".into()],
            ports: vec![ExposedPort::tcp(80)],
            networks: vec![attachment("net-bridge", "172.18.0.2")],
            ..Default::default()
        };
        let proposals = propose(&inventory(vec![container]), &DiscoverySettings::new("cnt.local"));
        assert!(proposals[0].names.is_empty());
        assert!(!proposals[0].is_complete());
    }

    #[test]
    fn compose_name_needs_both_labels() {
        let mut container = shop_api();
        container.labels.remove(COMPOSE_SERVICE_LABEL);
        let proposals = propose(&inventory(vec![container]), &DiscoverySettings::new("cnt.local"));
        assert!(!proposals[0].names.iter().any(|n| n.starts_with("api.shop")));
    }

    #[test]
    fn degenerate_names_are_skipped() {
        let container = ContainerInfo {
            id: "deadbeef".into(),
            names: vec!["/".into(), "/_web_".into()],
            networks: vec![attachment("net-bridge", "172.18.0.2")],
            ..Default::default()
        };
        let proposals = propose(&inventory(vec![container]), &DiscoverySettings::new("cnt.local"));
        assert_eq!(proposals[0].container_name, "web");
        assert_eq!(proposals[0].names, vec!["web.cnt.local", "web"]);
    }

    #[test]
    fn same_inventory_same_proposals() {
        let inventory = inventory(vec![shop_api()]);
        let settings = DiscoverySettings::new("cnt.local");
        assert_eq!(propose(&inventory, &settings), propose(&inventory, &settings));
    }
}
