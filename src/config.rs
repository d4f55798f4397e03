//! Configuration types for dns-routes.

use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};

use crate::error::Error;

/// The only configuration layout version this build understands.
pub const SUPPORTED_VERSION: &str = "1";

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Layout version; must equal [`SUPPORTED_VERSION`].
    pub version: String,

    /// Link, gateway and metric every managed route goes through.
    pub target: TargetConfig,

    /// Resolver used by sources that do not define their own.
    pub default_resolver: ResolverConfig,

    /// Domain groups, in order. A group's position is its identity.
    #[serde(default)]
    pub sources: Vec<SourceConfig>,

    /// Telemetry configuration.
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

/// Where routes are installed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Link (interface) name, e.g. "wg0".
    pub name: String,

    /// Gateway IPv4 literal, without prefix length.
    pub gateway: String,

    /// Route metric (kernel priority).
    #[serde(default)]
    pub metric: u32,
}

/// Nameservers and failure handling for resolution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolverConfig {
    /// Nameserver IP literals, tried in order.
    #[serde(default)]
    pub nameservers: Vec<String>,

    /// "drop" or "hold". Unset means "drop".
    #[serde(default)]
    pub on_failure: Option<String>,

    /// Per-query timeout (e.g. "5s"). Unset means the transport default.
    #[serde(default)]
    pub timeout: Option<String>,
}

/// One group of domains sharing an interval and a resolver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Update interval (e.g. "30m", "1h 30m"). Unset means one hour.
    #[serde(default)]
    pub interval: Option<String>,

    /// Domains to resolve.
    #[serde(default)]
    pub domains: Vec<String>,

    /// Group-specific resolver overriding `default_resolver`.
    #[serde(default)]
    pub resolver: Option<ResolverConfig>,
}

/// Telemetry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Log level filter (e.g., "info", "debug", "dns_routes=debug,warn").
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Prometheus metrics exporter address.
    #[serde(default)]
    pub prometheus_addr: Option<SocketAddr>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            prometheus_addr: None,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Structural checks that do not need the network or the kernel.
    ///
    /// Resolver and interval checks happen when the records are built,
    /// see [`crate::daemon::Daemon::from_config`].
    pub fn validate(&self) -> Result<(), Error> {
        if self.version != SUPPORTED_VERSION {
            return Err(Error::Config(format!(
                "version \"{}\" in config file is not supported",
                self.version
            )));
        }

        if self.sources.is_empty() {
            return Err(Error::Config("config does not have any sources".into()));
        }

        self.target.gateway_addr()?;
        if self.target.name.is_empty() || self.target.name.contains(' ') {
            return Err(Error::Config(format!(
                "invalid target.name (link) \"{}\"",
                self.target.name
            )));
        }

        Ok(())
    }
}

impl TargetConfig {
    /// Parse `gateway` as an IPv4 address.
    pub fn gateway_addr(&self) -> Result<Ipv4Addr, Error> {
        if self.gateway.is_empty() || self.gateway.contains('/') {
            return Err(Error::InvalidAddress(format!(
                "target.gateway \"{}\"",
                self.gateway
            )));
        }
        self.gateway
            .parse()
            .map_err(|_| Error::InvalidAddress(format!("target.gateway \"{}\"", self.gateway)))
    }
}
