use figment::{
    providers::{Env, Format, Json, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use crate::discovery::{DiscoverySettings, DEFAULT_HTTP_PORTS};
use crate::error::Result;
use crate::overrides::DeclarationSpec;

/// Environment variable naming an alternative TOML config file.
pub const CONFIG_PATH_ENV: &str = "CNTDNS_CONFIG";

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub dns_bind: SocketAddr,
    /// The proxy address doubles as the load-balancer address handed out by DNS.
    pub proxy_bind: SocketAddr,
    pub tld: String,
    pub dns_ttl: u32,
    pub http_ports: Vec<u16>,
    pub poll_interval_secs: u64,
    pub docker_timeout_secs: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub overrides_file: Option<PathBuf>,
    /// Static manual declarations.
    pub endpoints: Vec<DeclarationSpec>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            // Unconventional loopback addresses avoid clashing with other
            // listeners on :53 and :80.
            dns_bind: SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 53, 35)), 53),
            proxy_bind: SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 1, 99)), 80),
            tld: "cnt.local".into(),
            dns_ttl: 1,
            http_ports: DEFAULT_HTTP_PORTS.to_vec(),
            poll_interval_secs: 10,
            docker_timeout_secs: 5,
            overrides_file: Some(PathBuf::from("cntdns-overrides.toml")),
            endpoints: Vec::new(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file("cntdns.toml"))
            .merge(Json::file("cntdns.json"));
        if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
            figment = figment.merge(Toml::file(path));
        }
        let mut config: Config = figment.merge(Env::prefixed("CNTDNS_")).extract()?;

        config.tld = config.tld.trim_matches('.').to_string();
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(figment::Error::from(msg.to_string()).into());
        if self.tld.is_empty() {
            return invalid("tld must not be empty");
        }
        if self.poll_interval_secs == 0 {
            return invalid("poll_interval_secs must be greater than 0");
        }
        if self.docker_timeout_secs == 0 {
            return invalid("docker_timeout_secs must be greater than 0");
        }
        Ok(())
    }

    pub fn load_balancer_ip(&self) -> IpAddr {
        self.proxy_bind.ip()
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn docker_timeout(&self) -> Duration {
        Duration::from_secs(self.docker_timeout_secs)
    }

    pub fn discovery(&self) -> DiscoverySettings {
        DiscoverySettings {
            tld: self.tld.clone(),
            http_ports: self.http_ports.clone(),
        }
    }
}
