//! Route backend driving the `gobgp` CLI against a local gobgpd.

use crate::sync::{CommandRunner, RouteSpeaker, SyncError};
use async_trait::async_trait;
use std::collections::HashSet;
use std::net::Ipv4Addr;

const GOBGP: &str = "gobgp";

pub struct Gobgp {
    runner: CommandRunner,
}

impl Gobgp {
    pub fn new(runner: CommandRunner) -> Self {
        Self { runner }
    }
}

/// Parse `gobgp global rib -a ipv4` output, keeping locally originated
/// /32 routes (next hop 0.0.0.0).
pub(crate) fn parse_rib(output: &str) -> HashSet<Ipv4Addr> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| line.starts_with('*'))
        .filter_map(|line| {
            let mut fields = line.trim_start_matches(['*', '>']).split_whitespace();
            let (network, prefix) = fields.next()?.split_once('/')?;
            let next_hop = fields.next()?;
            if prefix != "32" || next_hop != "0.0.0.0" {
                return None;
            }
            network.parse().ok()
        })
        .collect()
}

#[async_trait]
impl RouteSpeaker for Gobgp {
    async fn routes(&self) -> Result<HashSet<Ipv4Addr>, SyncError> {
        let output = self
            .runner
            .run(GOBGP, &["global", "rib", "-a", "ipv4"])
            .await?;
        Ok(parse_rib(&output))
    }

    async fn announce(&self, address: Ipv4Addr) -> Result<(), SyncError> {
        let prefix = format!("{}/32", address);
        self.runner
            .run(GOBGP, &["global", "rib", "add", "-a", "ipv4", prefix.as_str()])
            .await?;
        Ok(())
    }

    async fn withdraw(&self, address: Ipv4Addr) -> Result<(), SyncError> {
        let prefix = format!("{}/32", address);
        self.runner
            .run(GOBGP, &["global", "rib", "del", "-a", "ipv4", prefix.as_str()])
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_rib() {
        let output = "\
   Network              Next Hop             AS_PATH              Age        Attrs
*> 192.168.0.1/32       0.0.0.0                                   00:00:05   [{Origin: i}]
*> 192.168.0.2/32       0.0.0.0                                   00:00:05   [{Origin: i}]
*> 10.20.0.0/16         172.16.0.1           65001                00:10:00   [{Origin: i}]
*  192.168.0.9/32       172.16.0.2           65002                00:10:00   [{Origin: i}]
";
        let routes = parse_rib(output);
        assert_eq!(routes.len(), 2);
        assert!(routes.contains(&"192.168.0.1".parse().unwrap()));
        assert!(routes.contains(&"192.168.0.2".parse().unwrap()));
    }

    #[test]
    fn test_parse_rib_empty_table() {
        assert!(parse_rib("Network not in table\n").is_empty());
    }
}
