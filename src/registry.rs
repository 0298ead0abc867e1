//! The endpoint registry: immutable snapshots and the published pointer.
//!
//! A [`Registry`] is never mutated once built. The reconciler produces a new
//! one each cycle and swaps it into a [`RegistryHandle`]; DNS and proxy
//! request handlers load whichever snapshot is current when they start and
//! keep using it until they finish.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use arc_swap::ArcSwap;
use log::warn;
use serde::{Deserialize, Serialize};

pub type EndpointId = u64;

/// How traffic for an endpoint is handled on the host.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProxyMode {
    Http,
    Https,
    Tcp,
    Udp,
    /// Only answer DNS, never proxy.
    #[default]
    DnsOnly,
}

impl ProxyMode {
    /// Whether DNS hands out the load-balancer address for this mode.
    pub fn is_load_balanced(self) -> bool {
        matches!(self, ProxyMode::Http | ProxyMode::Https)
    }
}

/// A service reachable at a fixed address, usually declared by hand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostTarget {
    pub ip: IpAddr,
    pub port: Option<u16>,
    /// Docker network ids this target was injected into, populated when it
    /// replaces a container.
    pub injected_networks: Vec<String>,
}

/// A discovered container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerTarget {
    pub container_id: String,
    /// Normalized container name, used to re-associate after recreation.
    pub container_name: String,
    pub ip: IpAddr,
    /// In-container port traffic is proxied to.
    pub port: Option<u16>,
    /// Host endpoint that currently replaces this container.
    pub overridden_by: Option<EndpointId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Host(HostTarget),
    Container(ContainerTarget),
}

/// A resolvable name with its routing target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub id: EndpointId,
    pub name: String,
    pub aliases: Vec<String>,
    pub target: Target,
    /// Pinned by a human; discovery never removes or retargets it.
    pub manual_override: bool,
    pub proxy_mode: ProxyMode,
}

impl Endpoint {
    /// Primary name followed by all aliases.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.name.as_str()).chain(self.aliases.iter().map(String::as_str))
    }

    pub fn ip(&self) -> IpAddr {
        match &self.target {
            Target::Host(host) => host.ip,
            Target::Container(container) => container.ip,
        }
    }

    pub fn port(&self) -> Option<u16> {
        match &self.target {
            Target::Host(host) => host.port,
            Target::Container(container) => container.port,
        }
    }

    pub fn container(&self) -> Option<&ContainerTarget> {
        match &self.target {
            Target::Container(container) => Some(container),
            Target::Host(_) => None,
        }
    }
}

/// Identity of a container endpoint that is no longer observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetiredEndpoint {
    pub id: EndpointId,
    pub container_name: String,
    pub names: Vec<String>,
}

/// Result of looking a name up in a snapshot.
#[derive(Debug, Clone, Copy)]
pub enum Lookup<'a> {
    Found(Resolution<'a>),
    /// Only a retired container ever answered to this name.
    Retired(&'a RetiredEndpoint),
    Missing,
}

/// A name bound to an endpoint, with overrides already followed.
#[derive(Debug, Clone, Copy)]
pub struct Resolution<'a> {
    /// The endpoint that owns the queried name.
    pub endpoint: &'a Endpoint,
    /// The endpoint whose target actually serves the name.
    pub effective: &'a Endpoint,
    /// The name lives in the load-balancer zone.
    pub via_load_balancer: bool,
}

/// Name of the load-balancer zone under `tld`.
pub fn load_balancer_zone(tld: &str) -> String {
    format!("lb.{tld}")
}

/// The load-balancer alias for `name`, if it is not already one.
///
/// `web.cnt.local` and bare `web` both map to `web.lb.cnt.local`.
pub fn load_balancer_alias(name: &str, tld: &str) -> Option<String> {
    let zone = load_balancer_zone(tld);
    if name == zone || name.ends_with(&format!(".{zone}")) {
        return None;
    }
    let stem = name.strip_suffix(&format!(".{tld}")).unwrap_or(name);
    if stem.is_empty() || stem == tld {
        return None;
    }
    Some(format!("{stem}.{zone}"))
}

/// An immutable version of the endpoint set.
#[derive(Debug, Clone)]
pub struct Registry {
    version: u64,
    tld: String,
    id_counter: EndpointId,
    endpoints: Vec<Endpoint>,
    retired: Vec<RetiredEndpoint>,
    index: HashMap<String, usize>,
    ids: HashMap<EndpointId, usize>,
    retired_index: HashMap<String, usize>,
}

impl Registry {
    /// An empty registry for `tld`, version zero.
    pub fn empty(tld: &str) -> Self {
        Self::assemble(0, tld.to_string(), 0, Vec::new(), Vec::new())
    }

    /// Build a snapshot and its lookup indexes.
    ///
    /// Names must already be unique across `endpoints`; if they are not, the
    /// first endpoint keeps the name so readers never see two targets.
    pub(crate) fn assemble(
        version: u64,
        tld: String,
        id_counter: EndpointId,
        endpoints: Vec<Endpoint>,
        retired: Vec<RetiredEndpoint>,
    ) -> Self {
        let mut index: HashMap<String, usize> = HashMap::new();
        let mut ids: HashMap<EndpointId, usize> = HashMap::with_capacity(endpoints.len());
        for (position, endpoint) in endpoints.iter().enumerate() {
            ids.entry(endpoint.id).or_insert(position);
            for name in endpoint.names() {
                if let Some(owner) = index.get(name) {
                    warn!(
                        "Name {} already bound to endpoint #{}, ignoring it for #{}",
                        name, endpoints[*owner].id, endpoint.id
                    );
                    continue;
                }
                index.insert(name.to_string(), position);
            }
        }

        let mut retired_index: HashMap<String, usize> = HashMap::new();
        for (position, entry) in retired.iter().enumerate() {
            for name in &entry.names {
                retired_index.entry(name.clone()).or_insert(position);
            }
        }

        Self {
            version,
            tld,
            id_counter,
            endpoints,
            retired,
            index,
            ids,
            retired_index,
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn tld(&self) -> &str {
        &self.tld
    }

    /// Last id handed out.
    pub fn id_counter(&self) -> EndpointId {
        self.id_counter
    }

    pub fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }

    pub fn retired(&self) -> &[RetiredEndpoint] {
        &self.retired
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&Endpoint> {
        self.index.get(name).map(|&position| &self.endpoints[position])
    }

    pub fn by_id(&self, id: EndpointId) -> Option<&Endpoint> {
        self.ids.get(&id).map(|&position| &self.endpoints[position])
    }

    /// Look up a name exactly as given.
    pub fn lookup(&self, name: &str) -> Lookup<'_> {
        let Some(endpoint) = self.get(name) else {
            return match self.retired_index.get(name) {
                Some(&position) => Lookup::Retired(&self.retired[position]),
                None => Lookup::Missing,
            };
        };

        let effective = endpoint
            .container()
            .and_then(|container| container.overridden_by)
            .and_then(|id| self.by_id(id))
            .unwrap_or(endpoint);

        let zone = load_balancer_zone(&self.tld);
        let in_zone = name.ends_with(&format!(".{zone}"));

        Lookup::Found(Resolution {
            endpoint,
            effective,
            via_load_balancer: in_zone && effective.proxy_mode.is_load_balanced(),
        })
    }

    /// Whether two snapshots carry the same endpoints and identities.
    pub fn same_content(&self, other: &Registry) -> bool {
        self.tld == other.tld
            && self.id_counter == other.id_counter
            && self.endpoints == other.endpoints
            && self.retired == other.retired
    }
}

/// The currently published snapshot, shared by all readers.
///
/// Loads are lock-free. The reconciler is the only writer.
#[derive(Debug, Clone)]
pub struct RegistryHandle {
    current: Arc<ArcSwap<Registry>>,
}

impl RegistryHandle {
    pub fn new(registry: Registry) -> Self {
        Self {
            current: Arc::new(ArcSwap::from_pointee(registry)),
        }
    }

    /// The latest published snapshot.
    pub fn current(&self) -> Arc<Registry> {
        self.current.load_full()
    }

    /// Replace the current snapshot with `next`.
    ///
    /// Returns `false` and keeps the current snapshot if `next` is not newer,
    /// so readers never go back in time.
    pub fn publish(&self, next: Registry) -> bool {
        let next = Arc::new(next);
        let previous = self.current.rcu(|current| {
            if next.version > current.version {
                Arc::clone(&next)
            } else {
                Arc::clone(current)
            }
        });
        if next.version > previous.version {
            true
        } else {
            warn!(
                "Refusing to publish registry v{} over v{}",
                next.version, previous.version
            );
            false
        }
    }
}
