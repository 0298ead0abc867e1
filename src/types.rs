//! Data structures shared between the container runtime, discovery and
//! the reconciler.
//!
//! The inventory types are a plain, runtime-agnostic picture of what the
//! container engine reports. Discovery works on these rather than on the
//! engine's API models so it can stay a pure function.

use std::collections::HashMap;
use std::net::IpAddr;

/// Transport protocol of an exposed container port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortProtocol {
    Tcp,
    Udp,
    Other,
}

/// A port declared as exposed by a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExposedPort {
    pub port: u16,
    pub protocol: PortProtocol,
}

impl ExposedPort {
    pub fn tcp(port: u16) -> Self {
        Self {
            port,
            protocol: PortProtocol::Tcp,
        }
    }
}

/// A container's membership in one network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkAttachment {
    pub network_id: String,
    /// Address of the container on that network, if it was assigned one.
    pub ip: Option<IpAddr>,
}

/// A running container as reported by the engine.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerInfo {
    pub id: String,
    /// Raw names, usually with a leading `/`.
    pub names: Vec<String>,
    pub labels: HashMap<String, String>,
    pub ports: Vec<ExposedPort>,
    /// Network memberships in a stable order.
    pub networks: Vec<NetworkAttachment>,
}

/// A network known to the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkInfo {
    pub id: String,
    pub driver: String,
}

/// One complete, point-in-time view of the container engine.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Inventory {
    pub containers: Vec<ContainerInfo>,
    pub networks: Vec<NetworkInfo>,
}

/// A reason to run a reconciliation cycle ahead of the periodic tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trigger {
    /// The engine reported a lifecycle change for a container or network.
    Container { action: String, container: String },
    /// The operator asked for a reload (SIGHUP).
    Reload,
}
