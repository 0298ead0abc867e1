//! Manual endpoint declarations.
//!
//! Humans pin endpoints either in the main configuration (`endpoints`) or
//! in a separate overrides file that can be edited while the daemon runs.
//! Declarations are authoritative over discovery for the names they claim.
//!
//! ```toml
//! [[endpoints]]
//! name = "db.cnt.local"
//! ip = "10.0.0.9"
//! port = 5432
//! proxy = "tcp"
//! overrides = "db-1"
//! ```

use std::net::IpAddr;
use std::path::{Path, PathBuf};

use figment::{
    providers::{Format, Json, Toml},
    Figment,
};
use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::normalize::normalize_name;
use crate::registry::ProxyMode;

/// A declaration as written in a configuration file.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct DeclarationSpec {
    pub name: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    pub ip: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default)]
    pub proxy: ProxyMode,
    /// Name of a container this host service stands in for.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overrides: Option<String>,
}

/// A validated declaration, ready to be merged into the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManualDeclaration {
    pub name: String,
    pub aliases: Vec<String>,
    pub ip: IpAddr,
    pub port: Option<u16>,
    pub proxy_mode: ProxyMode,
    pub overrides: Option<String>,
}

impl ManualDeclaration {
    pub fn new(name: &str, ip: IpAddr, port: Option<u16>, proxy_mode: ProxyMode) -> Self {
        Self {
            name: name.to_string(),
            aliases: Vec::new(),
            ip,
            port,
            proxy_mode,
            overrides: None,
        }
    }
}

impl DeclarationSpec {
    pub fn validate(&self) -> Result<ManualDeclaration> {
        let invalid = |reason: String| Error::InvalidDeclaration {
            name: self.name.clone(),
            reason,
        };

        let name = normalize_name(&self.name);
        if name.is_empty() {
            return Err(invalid("name has no valid DNS characters".into()));
        }

        let mut aliases = Vec::with_capacity(self.aliases.len());
        for alias in &self.aliases {
            let normalized = normalize_name(alias);
            if normalized.is_empty() {
                return Err(invalid(format!("alias `{alias}` has no valid DNS characters")));
            }
            if normalized != name && !aliases.contains(&normalized) {
                aliases.push(normalized);
            }
        }

        let ip: IpAddr = self
            .ip
            .trim()
            .parse()
            .map_err(|e| invalid(format!("invalid ip `{}`: {e}", self.ip)))?;

        match (self.port, self.proxy) {
            (Some(0), _) => return Err(invalid("port must not be 0".into())),
            (None, ProxyMode::DnsOnly) => {}
            (None, mode) => return Err(invalid(format!("proxy mode {mode:?} needs a port"))),
            (Some(_), _) => {}
        }

        let overrides = match &self.overrides {
            Some(target) => {
                let normalized = normalize_name(target);
                if normalized.is_empty() {
                    return Err(invalid(format!("overridden container `{target}` is not a valid name")));
                }
                Some(normalized)
            }
            None => None,
        };

        Ok(ManualDeclaration {
            name,
            aliases,
            ip,
            port: self.port,
            proxy_mode: self.proxy,
            overrides,
        })
    }
}

/// Validate `specs`, dropping and reporting the malformed ones.
pub fn validate_all(specs: &[DeclarationSpec]) -> Vec<ManualDeclaration> {
    specs
        .iter()
        .filter_map(|spec| match spec.validate() {
            Ok(declaration) => Some(declaration),
            Err(e) => {
                warn!("Rejecting manual declaration: {}", e);
                None
            }
        })
        .collect()
}

/// Anything that can yield the current set of manual declarations.
///
/// Implementations may block (file reads); the reconciler calls them on
/// tokio's blocking pool.
pub trait ManualSource: Send + Sync {
    fn declarations(&self) -> Result<Vec<ManualDeclaration>>;
}

/// Declarations fixed at startup.
#[derive(Debug, Clone, Default)]
pub struct StaticDeclarations(pub Vec<ManualDeclaration>);

impl StaticDeclarations {
    pub fn from_specs(specs: &[DeclarationSpec]) -> Self {
        Self(validate_all(specs))
    }
}

impl ManualSource for StaticDeclarations {
    fn declarations(&self) -> Result<Vec<ManualDeclaration>> {
        Ok(self.0.clone())
    }
}

#[derive(Debug, Default, Deserialize)]
struct OverridesFile {
    #[serde(default)]
    endpoints: Vec<DeclarationSpec>,
}

/// Declarations read from a TOML or JSON file on every call.
///
/// A missing file means there are no overrides.
#[derive(Debug, Clone)]
pub struct FileOverrides {
    path: PathBuf,
}

impl FileOverrides {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ManualSource for FileOverrides {
    fn declarations(&self) -> Result<Vec<ManualDeclaration>> {
        let is_json = self
            .path
            .extension()
            .is_some_and(|extension| extension.eq_ignore_ascii_case("json"));
        let figment = if is_json {
            Figment::from(Json::file(&self.path))
        } else {
            Figment::from(Toml::file(&self.path))
        };
        let file: OverridesFile = figment.extract()?;
        debug!(
            "Loaded {} manual declarations from {}",
            file.endpoints.len(),
            self.path.display()
        );
        Ok(validate_all(&file.endpoints))
    }
}
