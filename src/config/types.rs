//! Configuration data types.

use crate::model::{CheckSpec, Destination, Service};
use crate::util::duration::humantime_serde;
use cidr::Ipv4Cidr;
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

/// Root configuration structure.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// Global settings
    #[serde(default)]
    pub global: GlobalConfig,

    /// This balancer instance
    #[serde(default)]
    pub node: NodeConfig,

    /// Defaults for check specs that leave interval/timeout at zero
    #[serde(default)]
    pub health_check_defaults: HealthCheckDefaults,

    /// Services applied through the operation API at startup and on reload
    #[serde(default)]
    pub services: Vec<ServiceSeed>,
}

/// Global configuration settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GlobalConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log format: json or pretty
    #[serde(default)]
    pub log_format: LogFormat,

    /// Metrics configuration
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: LogFormat::Json,
            metrics: MetricsConfig::default(),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

/// Metrics endpoint configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MetricsConfig {
    /// Whether metrics endpoint is enabled
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Address to bind metrics server
    #[serde(default = "default_metrics_address")]
    pub address: SocketAddr,

    /// Path for metrics endpoint
    #[serde(default = "default_metrics_path")]
    pub path: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            address: default_metrics_address(),
            path: default_metrics_path(),
        }
    }
}

/// Settings describing this balancer instance.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NodeConfig {
    /// Identity used in leader election
    #[serde(default = "default_node_id")]
    pub id: String,

    /// Interface carrying the virtual addresses
    #[serde(default = "default_interface")]
    pub interface: String,

    /// Unicast (leader owns the VIPs) or anycast (every node announces routes)
    #[serde(default)]
    pub mode: DeployMode,

    /// Source address for SNAT of NAT-mode services
    #[serde(default)]
    pub outbound_address: Option<Ipv4Addr>,

    /// Address pools for VIP allocation, scanned in declaration order
    #[serde(default)]
    pub vip_ranges: Vec<Ipv4Cidr>,

    /// Which implementation drives the external systems
    #[serde(default)]
    pub backend: BackendKind,

    /// Upper bound for each external command
    #[serde(default = "default_command_timeout", with = "humantime_serde")]
    pub command_timeout: Duration,

    /// How often gauges are refreshed from the state model
    #[serde(default = "default_metrics_interval", with = "humantime_serde")]
    pub metrics_interval: Duration,

    /// Dedicated NAT chain for SNAT rules
    #[serde(default = "default_nat_chain")]
    pub nat_chain: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: default_node_id(),
            interface: default_interface(),
            mode: DeployMode::default(),
            outbound_address: None,
            vip_ranges: Vec::new(),
            backend: BackendKind::default(),
            command_timeout: default_command_timeout(),
            metrics_interval: default_metrics_interval(),
            nat_chain: default_nat_chain(),
        }
    }
}

/// How virtual addresses are made reachable.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DeployMode {
    /// The elected leader assigns VIPs to its interface.
    #[default]
    Unicast,
    /// Every node announces VIP routes; the network picks a path.
    Anycast,
}

/// Implementation behind the synchronizers.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// ipvsadm, iptables, ip, arping and gobgp.
    #[default]
    System,
    /// In-process tables, nothing touches the host.
    Memory,
}

/// Default health check settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HealthCheckDefaults {
    /// How often to probe destinations
    #[serde(default = "default_health_interval", with = "humantime_serde")]
    pub interval: Duration,

    /// Timeout for a single probe
    #[serde(default = "default_health_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for HealthCheckDefaults {
    fn default() -> Self {
        Self {
            interval: default_health_interval(),
            timeout: default_health_timeout(),
        }
    }
}

/// A declarative service entry with its destinations and checks.
///
/// `service_id` of nested entries may be omitted; it is filled from the
/// enclosing service.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServiceSeed {
    #[serde(flatten)]
    pub service: Service,

    #[serde(default)]
    pub destinations: Vec<Destination>,

    #[serde(default)]
    pub checks: Vec<CheckSpec>,
}

impl ServiceSeed {
    /// Destinations with their owning service filled in.
    pub fn bound_destinations(&self) -> Vec<Destination> {
        self.destinations
            .iter()
            .cloned()
            .map(|mut d| {
                d.service_id = self.service.name.clone();
                d
            })
            .collect()
    }

    /// Checks with their owning service filled in.
    pub fn bound_checks(&self) -> Vec<CheckSpec> {
        self.checks
            .iter()
            .cloned()
            .map(|mut c| {
                c.service_id = self.service.name.clone();
                c
            })
            .collect()
    }
}

// Default value functions
fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

fn default_metrics_address() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 9090))
}

fn default_metrics_path() -> String {
    "/metrics".to_string()
}

fn default_node_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn default_interface() -> String {
    "eth0".to_string()
}

fn default_command_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_metrics_interval() -> Duration {
    Duration::from_secs(15)
}

fn default_nat_chain() -> String {
    "L4PLANE".to_string()
}

fn default_health_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_health_timeout() -> Duration {
    Duration::from_secs(5)
}
