//! Desired-state entities: services, destinations and health check specs.

use crate::util::duration::humantime_serde;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

/// A virtual address/port pair clients connect to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct Service {
    /// Unique, externally assigned identity.
    pub name: String,

    /// Virtual address, assigned by the allocator. `None` until allocated.
    #[serde(default)]
    pub address: Option<Ipv4Addr>,

    /// Virtual port.
    pub port: u16,

    /// Transport protocol.
    #[serde(default)]
    pub protocol: Protocol,

    /// Kernel scheduling algorithm.
    #[serde(default)]
    pub scheduler: Scheduler,

    /// Forwarding method towards the destinations.
    #[serde(default)]
    pub mode: ForwardMode,

    /// Session affinity timeout in seconds, 0 disables persistence.
    #[serde(default)]
    pub persistent: u32,
}

impl Service {
    /// Create a service with default protocol, scheduler and mode.
    pub fn new(name: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            address: None,
            port,
            protocol: Protocol::default(),
            scheduler: Scheduler::default(),
            mode: ForwardMode::default(),
            persistent: 0,
        }
    }

    /// The allocated virtual endpoint, if an address has been assigned.
    pub fn endpoint(&self) -> Option<SocketAddr> {
        self.address
            .map(|ip| SocketAddr::V4(SocketAddrV4::new(ip, self.port)))
    }
}

/// A real server backing a service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct Destination {
    /// Unique identity.
    pub name: String,

    /// Real server address.
    pub address: Ipv4Addr,

    /// Real server port.
    pub port: u16,

    /// Relative weight for weighted schedulers.
    #[serde(default = "default_weight")]
    pub weight: u32,

    /// Forwarding method for this destination, inherited from the service when unset.
    #[serde(default)]
    pub mode: Option<ForwardMode>,

    /// Name of the owning service.
    #[serde(default)]
    pub service_id: String,
}

impl Destination {
    /// Create a destination bound to `service_id` with weight 1.
    pub fn new(
        name: impl Into<String>,
        service_id: impl Into<String>,
        address: Ipv4Addr,
        port: u16,
    ) -> Self {
        Self {
            name: name.into(),
            address,
            port,
            weight: default_weight(),
            mode: None,
            service_id: service_id.into(),
        }
    }

    /// Socket address of the real server.
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.address, self.port))
    }

    /// Forwarding method actually used towards this destination.
    pub fn effective_mode(&self, service: &Service) -> ForwardMode {
        self.mode.unwrap_or(service.mode)
    }
}

/// A health check definition bound to a service.
///
/// Every destination of the service gets its own running check derived
/// from this spec.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct CheckSpec {
    /// Identity of the spec. Derived from the service and probe type when empty.
    #[serde(default)]
    pub id: String,

    /// Name of the service whose destinations are probed.
    #[serde(default)]
    pub service_id: String,

    /// Probe type and its parameters.
    #[serde(flatten)]
    pub probe: Probe,

    /// Time between probes, zero means the configured default.
    #[serde(default, with = "humantime_serde")]
    pub interval: Duration,

    /// Probe timeout, zero means the configured default.
    #[serde(default, with = "humantime_serde")]
    pub timeout: Duration,
}

impl CheckSpec {
    /// Create a spec with zero interval/timeout, to be defaulted on add.
    pub fn new(service_id: impl Into<String>, probe: Probe) -> Self {
        let mut spec = Self {
            id: String::new(),
            service_id: service_id.into(),
            probe,
            interval: Duration::ZERO,
            timeout: Duration::ZERO,
        };
        spec.id = spec.default_id();
        spec
    }

    /// `<service>-<type>`, used when no explicit id was given.
    pub fn default_id(&self) -> String {
        format!("{}-{}", self.service_id, self.probe.kind())
    }

    /// Fill zero interval/timeout and an empty id.
    pub fn apply_defaults(&mut self, interval: Duration, timeout: Duration) {
        if self.interval.is_zero() {
            self.interval = interval;
        }
        if self.timeout.is_zero() {
            self.timeout = timeout;
        }
        if self.id.is_empty() {
            self.id = self.default_id();
        }
    }
}

/// Probe type with its type-specific parameters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Probe {
    /// TCP connect.
    Tcp,
    /// HTTP GET with an expected status.
    Http {
        #[serde(default = "default_http_path")]
        path: String,
        #[serde(default = "default_expected_status")]
        expected_status: u16,
    },
    /// External command, exit status 0 is healthy.
    Script {
        command: String,
        #[serde(default)]
        args: Vec<String>,
    },
}

impl Probe {
    /// Short type name, as written in configuration.
    pub fn kind(&self) -> &'static str {
        match self {
            Probe::Tcp => "tcp",
            Probe::Http { .. } => "http",
            Probe::Script { .. } => "script",
        }
    }
}

/// Transport protocol of a service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => f.write_str("tcp"),
            Protocol::Udp => f.write_str("udp"),
        }
    }
}

/// Kernel scheduling algorithms.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Scheduler {
    /// Round robin.
    #[default]
    Rr,
    /// Weighted round robin.
    Wrr,
    /// Least connection.
    Lc,
    /// Weighted least connection.
    Wlc,
    /// Locality-based least connection.
    Lblc,
    /// Locality-based least connection with replication.
    Lblcr,
    /// Destination hashing.
    Dh,
    /// Source hashing.
    Sh,
    /// Shortest expected delay.
    Sed,
    /// Never queue.
    Nq,
}

impl Scheduler {
    /// Name used by the kernel table.
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheduler::Rr => "rr",
            Scheduler::Wrr => "wrr",
            Scheduler::Lc => "lc",
            Scheduler::Wlc => "wlc",
            Scheduler::Lblc => "lblc",
            Scheduler::Lblcr => "lblcr",
            Scheduler::Dh => "dh",
            Scheduler::Sh => "sh",
            Scheduler::Sed => "sed",
            Scheduler::Nq => "nq",
        }
    }

    /// Parse a kernel scheduler name.
    pub fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "rr" => Scheduler::Rr,
            "wrr" => Scheduler::Wrr,
            "lc" => Scheduler::Lc,
            "wlc" => Scheduler::Wlc,
            "lblc" => Scheduler::Lblc,
            "lblcr" => Scheduler::Lblcr,
            "dh" => Scheduler::Dh,
            "sh" => Scheduler::Sh,
            "sed" => Scheduler::Sed,
            "nq" => Scheduler::Nq,
            _ => return None,
        })
    }
}

impl fmt::Display for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Packet forwarding method.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ForwardMode {
    /// Masquerading, the balancer rewrites addresses.
    #[default]
    Nat,
    /// Direct routing.
    Route,
    /// IP-in-IP tunneling.
    Tunnel,
}

impl fmt::Display for ForwardMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ForwardMode::Nat => f.write_str("nat"),
            ForwardMode::Route => f.write_str("route"),
            ForwardMode::Tunnel => f.write_str("tunnel"),
        }
    }
}

fn default_weight() -> u32 {
    1
}

fn default_http_path() -> String {
    "/".to_string()
}

fn default_expected_status() -> u16 {
    200
}
