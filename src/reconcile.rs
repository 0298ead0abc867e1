//! Merging of discovery proposals and manual declarations into a new
//! registry snapshot.
//!
//! Precedence, highest first:
//!
//! 1. manual declarations, which keep the id of the manual endpoint with the
//!    same name;
//! 2. proposals matching a live container endpoint by container id or name,
//!    which keep its id;
//! 3. new proposals, which reuse a retired id for the same container name or
//!    get a fresh one.
//!
//! Names are claimed in that order and the first claimant keeps a name. A
//! proposal that would lose any of its names to another endpoint is dropped
//! as a whole. Container endpoints that are no longer proposed are retired.

use std::collections::{HashMap, HashSet};

use log::{debug, info, warn};

use crate::discovery::Proposal;
use crate::overrides::ManualDeclaration;
use crate::registry::{
    load_balancer_alias, ContainerTarget, Endpoint, EndpointId, HostTarget, ProxyMode, Registry,
    RetiredEndpoint, Target,
};

/// Upper bound on remembered identities of vanished containers.
pub const MAX_RETIRED: usize = 512;

/// A name that could not be given to a claimant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conflict {
    pub name: String,
    pub owner: EndpointId,
    /// Container name or declaration name that lost the name.
    pub rejected: String,
}

/// What a reconciliation produced.
#[derive(Debug)]
pub struct Outcome {
    pub registry: Registry,
    pub conflicts: Vec<Conflict>,
    pub added: Vec<EndpointId>,
    pub removed: Vec<EndpointId>,
}

struct Builder<'a> {
    tld: &'a str,
    id_counter: EndpointId,
    claimed: HashMap<String, EndpointId>,
    endpoints: Vec<Endpoint>,
    conflicts: Vec<Conflict>,
}

impl Builder<'_> {
    fn fresh_id(&mut self) -> EndpointId {
        self.id_counter += 1;
        self.id_counter
    }

    /// Claim as many of `names` as possible for `owner`.
    ///
    /// Returns the names that were granted, in their original order.
    fn claim(&mut self, names: &[String], owner: EndpointId, claimant: &str) -> Vec<String> {
        let mut granted = Vec::with_capacity(names.len());
        for name in names {
            match self.claimed.get(name) {
                Some(&existing) if existing == owner => {}
                Some(&existing) => {
                    warn!(
                        "Name {} is already owned by endpoint #{}, dropping it for {}",
                        name, existing, claimant
                    );
                    self.conflicts.push(Conflict {
                        name: name.clone(),
                        owner: existing,
                        rejected: claimant.to_string(),
                    });
                }
                None => {
                    self.claimed.insert(name.clone(), owner);
                    granted.push(name.clone());
                }
            }
        }
        granted
    }

    /// Names in `names` already owned by an endpoint other than `owner`.
    fn taken_by_others(&self, names: &[String], owner: EndpointId) -> Vec<(String, EndpointId)> {
        names
            .iter()
            .filter_map(|name| match self.claimed.get(name) {
                Some(&existing) if existing != owner => Some((name.clone(), existing)),
                _ => None,
            })
            .collect()
    }

    fn admit_manual(&mut self, declaration: &ManualDeclaration, previous: Option<&Endpoint>) {
        let mut names = vec![declaration.name.clone()];
        names.extend(declaration.aliases.iter().cloned());
        if declaration.proxy_mode.is_load_balanced() {
            let balanced: Vec<String> = names
                .iter()
                .filter_map(|name| load_balancer_alias(name, self.tld))
                .collect();
            names.extend(balanced);
        }
        dedup(&mut names);

        if self.claimed.contains_key(&declaration.name) {
            let owner = self.claimed[&declaration.name];
            warn!(
                "Manual declaration {} collides with endpoint #{}, ignoring it",
                declaration.name, owner
            );
            self.conflicts.push(Conflict {
                name: declaration.name.clone(),
                owner,
                rejected: declaration.name.clone(),
            });
            return;
        }

        let id = previous.map_or_else(|| self.fresh_id(), |endpoint| endpoint.id);
        let mut granted = self.claim(&names, id, &declaration.name);
        let name = granted.remove(0);

        let injected_networks = previous
            .and_then(|endpoint| match &endpoint.target {
                Target::Host(host) => Some(host.injected_networks.clone()),
                Target::Container(_) => None,
            })
            .unwrap_or_default();

        self.endpoints.push(Endpoint {
            id,
            name,
            aliases: granted,
            target: Target::Host(HostTarget {
                ip: declaration.ip,
                port: declaration.port,
                injected_networks,
            }),
            manual_override: true,
            proxy_mode: declaration.proxy_mode,
        });
    }

    /// Admit a complete proposal under `id`. Returns `false` if it has no
    /// address or names, or if another endpoint owns any of its names.
    fn admit_proposal(&mut self, proposal: &Proposal, id: EndpointId) -> bool {
        let Some(ip) = proposal.ip else {
            return false;
        };
        let taken = self.taken_by_others(&proposal.names, id);
        if !taken.is_empty() {
            for (name, owner) in taken {
                warn!(
                    "Name {} is already owned by endpoint #{}, dropping container {}",
                    name, owner, proposal.container_name
                );
                self.conflicts.push(Conflict {
                    name,
                    owner,
                    rejected: proposal.container_name.clone(),
                });
            }
            return false;
        }

        let mut granted = self.claim(&proposal.names, id, &proposal.container_name);
        if granted.is_empty() {
            return false;
        }
        let name = granted.remove(0);
        let proxy_mode = if proposal.http_port.is_some() {
            ProxyMode::Http
        } else {
            ProxyMode::DnsOnly
        };

        self.endpoints.push(Endpoint {
            id,
            name,
            aliases: granted,
            target: Target::Container(ContainerTarget {
                container_id: proposal.container_id.clone(),
                container_name: proposal.container_name.clone(),
                ip,
                port: proposal.http_port,
                overridden_by: None,
            }),
            manual_override: false,
            proxy_mode,
        });
        true
    }
}

fn dedup(names: &mut Vec<String>) {
    let mut seen = HashSet::new();
    names.retain(|name| seen.insert(name.clone()));
}

/// Produce the next snapshot from `current`, the latest discovery output and
/// the authoritative set of manual declarations.
///
/// `current` is left untouched; readers holding it keep a consistent view.
pub fn reconcile(
    current: &Registry,
    proposals: &[Proposal],
    manual: &[ManualDeclaration],
) -> Outcome {
    let mut builder = Builder {
        tld: current.tld(),
        id_counter: current.id_counter(),
        claimed: HashMap::new(),
        endpoints: Vec::new(),
        conflicts: Vec::new(),
    };

    for declaration in manual {
        let previous = current
            .endpoints()
            .iter()
            .find(|endpoint| endpoint.manual_override && endpoint.name == declaration.name);
        builder.admit_manual(declaration, previous);
    }

    // Pair proposals with the live container endpoints they continue.
    let complete: Vec<&Proposal> = proposals.iter().filter(|p| p.is_complete()).collect();
    for proposal in proposals.iter().filter(|p| !p.is_complete()) {
        debug!(
            "Container {} has no bridge network address or usable name, skipping",
            proposal.container_name
        );
    }

    let mut continued: Vec<(EndpointId, &Proposal)> = Vec::new();
    let mut used: HashSet<usize> = HashSet::new();
    for endpoint in current.endpoints().iter().filter(|e| !e.manual_override) {
        let Some(target) = endpoint.container() else {
            continue;
        };
        let matched = complete
            .iter()
            .enumerate()
            .filter(|(position, _)| !used.contains(position))
            .find(|(_, proposal)| proposal.container_id == target.container_id)
            .or_else(|| {
                complete
                    .iter()
                    .enumerate()
                    .filter(|(position, _)| !used.contains(position))
                    .find(|(_, proposal)| proposal.container_name == target.container_name)
            })
            .map(|(position, proposal)| (position, *proposal));
        if let Some((position, proposal)) = matched {
            used.insert(position);
            continued.push((endpoint.id, proposal));
        }
    }

    let mut retired: Vec<RetiredEndpoint> = current.retired().to_vec();
    let mut added = Vec::new();

    for (id, proposal) in &continued {
        builder.admit_proposal(proposal, *id);
    }
    for (position, proposal) in complete.iter().enumerate() {
        if used.contains(&position) {
            continue;
        }
        let revived = retired
            .iter()
            .position(|entry| entry.container_name == proposal.container_name);
        let id = match revived {
            Some(index) => retired[index].id,
            None => builder.id_counter + 1,
        };
        if builder.admit_proposal(proposal, id) {
            match revived {
                Some(index) => {
                    retired.remove(index);
                }
                None => {
                    builder.fresh_id();
                }
            }
            added.push(id);
        }
    }

    link_overrides(&mut builder.endpoints, manual, proposals);

    // Everything not carried forward is gone.
    let kept: HashSet<EndpointId> = builder.endpoints.iter().map(|e| e.id).collect();
    let mut removed = Vec::new();
    for endpoint in current.endpoints() {
        if kept.contains(&endpoint.id) {
            continue;
        }
        removed.push(endpoint.id);
        if let Some(target) = endpoint.container() {
            retired.retain(|entry| entry.container_name != target.container_name);
            retired.push(RetiredEndpoint {
                id: endpoint.id,
                container_name: target.container_name.clone(),
                names: endpoint.names().map(str::to_string).collect(),
            });
        }
    }
    if retired.len() > MAX_RETIRED {
        let excess = retired.len() - MAX_RETIRED;
        retired.drain(..excess);
    }
    retired.retain(|entry| !kept.contains(&entry.id));

    let added: Vec<EndpointId> = added
        .into_iter()
        .chain(
            builder
                .endpoints
                .iter()
                .filter(|e| e.manual_override && current.by_id(e.id).is_none())
                .map(|e| e.id),
        )
        .collect();

    if !added.is_empty() || !removed.is_empty() {
        info!(
            "Reconciled registry v{}: {} endpoints, {} added, {} removed",
            current.version() + 1,
            builder.endpoints.len(),
            added.len(),
            removed.len()
        );
    }

    let registry = Registry::assemble(
        current.version() + 1,
        current.tld().to_string(),
        builder.id_counter,
        builder.endpoints,
        retired,
    );

    Outcome {
        registry,
        conflicts: builder.conflicts,
        added,
        removed,
    }
}

/// Point overridden containers at the host endpoints replacing them and
/// record the container's networks on the host endpoint.
fn link_overrides(
    endpoints: &mut [Endpoint],
    manual: &[ManualDeclaration],
    proposals: &[Proposal],
) {
    let mut links: Vec<(EndpointId, &str)> = Vec::new();
    for declaration in manual {
        let Some(container) = declaration.overrides.as_deref() else {
            continue;
        };
        let host = endpoints
            .iter()
            .find(|e| e.manual_override && e.name == declaration.name);
        if let Some(host) = host {
            links.push((host.id, container));
        }
    }

    for (host_id, container) in links {
        let mut networks: Option<Vec<String>> = None;
        for endpoint in endpoints.iter_mut() {
            let Target::Container(target) = &mut endpoint.target else {
                continue;
            };
            let matches = target.container_name == container
                || endpoint.name == container
                || endpoint.aliases.iter().any(|alias| alias == container);
            if !matches || target.overridden_by.is_some() {
                continue;
            }
            target.overridden_by = Some(host_id);
            if networks.is_none() {
                networks = proposals
                    .iter()
                    .find(|p| p.container_id == target.container_id)
                    .map(|p| p.networks.clone());
            }
            debug!(
                "Container {} is overridden by endpoint #{}",
                target.container_name, host_id
            );
        }

        if let Some(networks) = networks {
            let host = endpoints.iter_mut().find(|e| e.id == host_id);
            if let Some(Endpoint {
                target: Target::Host(host),
                ..
            }) = host
            {
                host.injected_networks = networks;
            }
        }
    }
}
