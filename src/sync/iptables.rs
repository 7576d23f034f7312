//! Firewall backend driving `iptables` in the nat table.

use crate::sync::{CommandRunner, Firewall, SnatRule, SyncError};
use async_trait::async_trait;
use std::net::Ipv4Addr;
use tracing::{debug, info};

const IPTABLES: &str = "iptables";

pub struct Iptables {
    runner: CommandRunner,
    chain: String,
}

impl Iptables {
    pub fn new(runner: CommandRunner, chain: impl Into<String>) -> Self {
        Self {
            runner,
            chain: chain.into(),
        }
    }

    fn rule_args(&self, op: &str, rule: &SnatRule) -> Vec<String> {
        vec![
            "-t".to_string(),
            "nat".to_string(),
            op.to_string(),
            self.chain.clone(),
            "-m".to_string(),
            "ipvs".to_string(),
            "--vaddr".to_string(),
            format!("{}/32", rule.vip),
            "--vport".to_string(),
            rule.port.to_string(),
            "-j".to_string(),
            "SNAT".to_string(),
            "--to-source".to_string(),
            rule.to_source.to_string(),
        ]
    }
}

/// Parse `iptables -t nat -S <chain>` output into SNAT rules.
///
/// Rules of any other shape in the chain are ignored.
pub(crate) fn parse_rules(output: &str, chain: &str) -> Vec<SnatRule> {
    let prefix = format!("-A {} ", chain);
    output
        .lines()
        .filter_map(|line| line.strip_prefix(prefix.as_str()))
        .filter_map(|rule| {
            let fields: Vec<&str> = rule.split_whitespace().collect();
            let value = |flag: &str| {
                fields
                    .iter()
                    .position(|f| *f == flag)
                    .and_then(|i| fields.get(i + 1))
                    .copied()
            };
            let vip: Ipv4Addr = value("--vaddr")?.trim_end_matches("/32").parse().ok()?;
            let port: u16 = value("--vport")?.parse().ok()?;
            let to_source: Ipv4Addr = value("--to-source")?.parse().ok()?;
            Some(SnatRule {
                vip,
                port,
                to_source,
            })
        })
        .collect()
}

#[async_trait]
impl Firewall for Iptables {
    async fn ensure_chain(&self) -> Result<(), SyncError> {
        let chain = self.chain.as_str();
        if !self
            .runner
            .succeeds(IPTABLES, &["-t", "nat", "-S", chain])
            .await?
        {
            self.runner.run(IPTABLES, &["-t", "nat", "-N", chain]).await?;
            info!(chain, "created nat chain");
        }

        if !self
            .runner
            .succeeds(IPTABLES, &["-t", "nat", "-C", "POSTROUTING", "-j", chain])
            .await?
        {
            self.runner
                .run(IPTABLES, &["-t", "nat", "-A", "POSTROUTING", "-j", chain])
                .await?;
            info!(chain, "hooked nat chain into POSTROUTING");
        } else {
            debug!(chain, "nat chain already in place");
        }
        Ok(())
    }

    async fn rules(&self) -> Result<Vec<SnatRule>, SyncError> {
        let output = self
            .runner
            .run(IPTABLES, &["-t", "nat", "-S", self.chain.as_str()])
            .await?;
        Ok(parse_rules(&output, &self.chain))
    }

    async fn add_rule(&self, rule: &SnatRule) -> Result<(), SyncError> {
        self.runner.run(IPTABLES, &self.rule_args("-A", rule)).await?;
        Ok(())
    }

    async fn delete_rule(&self, rule: &SnatRule) -> Result<(), SyncError> {
        self.runner.run(IPTABLES, &self.rule_args("-D", rule)).await?;
        Ok(())
    }
}
