//! Interface backend driving `ip` and `arping`.
//!
//! Managed addresses are bound as /32 with the label `<interface>:vip`,
//! which is how they are told apart from the host's own addresses.

use crate::sync::{CommandRunner, InterfaceAddrs, SyncError};
use async_trait::async_trait;
use std::collections::HashSet;
use std::net::Ipv4Addr;

const IP: &str = "ip";
const ARPING: &str = "arping";

pub struct IpRoute {
    runner: CommandRunner,
    interface: String,
    label: String,
}

impl IpRoute {
    pub fn new(runner: CommandRunner, interface: impl Into<String>) -> Self {
        let interface = interface.into();
        let label = format!("{}:vip", interface);
        Self {
            runner,
            interface,
            label,
        }
    }
}

/// Parse `ip -4 -o addr show dev <interface>` output, keeping /32
/// addresses carrying `label`.
pub(crate) fn parse_addresses(output: &str, label: &str) -> HashSet<Ipv4Addr> {
    output
        .lines()
        .filter_map(|line| {
            // Everything after the backslash is lifetime information.
            let head = line.split('\\').next()?;
            let fields: Vec<&str> = head.split_whitespace().collect();
            let inet = fields.iter().position(|f| *f == "inet")?;
            let (address, prefix) = fields.get(inet + 1)?.split_once('/')?;
            if prefix != "32" || fields.last() != Some(&label) {
                return None;
            }
            address.parse().ok()
        })
        .collect()
}

#[async_trait]
impl InterfaceAddrs for IpRoute {
    async fn addresses(&self) -> Result<HashSet<Ipv4Addr>, SyncError> {
        let output = self
            .runner
            .run(IP, &["-4", "-o", "addr", "show", "dev", self.interface.as_str()])
            .await?;
        Ok(parse_addresses(&output, &self.label))
    }

    async fn add_address(&self, address: Ipv4Addr) -> Result<(), SyncError> {
        let cidr = format!("{}/32", address);
        self.runner
            .run(
                IP,
                &[
                    "addr",
                    "add",
                    cidr.as_str(),
                    "dev",
                    self.interface.as_str(),
                    "label",
                    self.label.as_str(),
                ],
            )
            .await?;
        Ok(())
    }

    async fn remove_address(&self, address: Ipv4Addr) -> Result<(), SyncError> {
        let cidr = format!("{}/32", address);
        self.runner
            .run(IP, &["addr", "del", cidr.as_str(), "dev", self.interface.as_str()])
            .await?;
        Ok(())
    }

    async fn announce(&self, address: Ipv4Addr) -> Result<(), SyncError> {
        let address = address.to_string();
        self.runner
            .run(
                ARPING,
                &[
                    "-U",
                    "-c",
                    "1",
                    "-I",
                    self.interface.as_str(),
                    "-s",
                    address.as_str(),
                    address.as_str(),
                ],
            )
            .await?;
        Ok(())
    }
}
