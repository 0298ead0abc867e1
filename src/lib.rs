//! Local DNS and HTTP reverse proxy for Docker containers.
//!
//! Running containers are discovered through the Docker API, given stable
//! names under a configurable TLD and published as an immutable
//! [`registry::Registry`] snapshot. The DNS server and the reverse proxy only
//! ever read the current snapshot; the [`reconciler::Reconciler`] replaces it
//! atomically whenever Docker or the manual declarations change.

pub mod config;
pub mod discovery;
pub mod dns_server;
pub mod error;
pub mod normalize;
pub mod overrides;
pub mod proxy;
pub mod reconcile;
pub mod reconciler;
pub mod registry;
pub mod runtime;
pub mod types;

pub use config::Config;
pub use error::{Error, Result};
pub use registry::{Registry, RegistryHandle};
