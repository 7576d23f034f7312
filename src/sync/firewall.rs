//! Source NAT synchronizer.
//!
//! NAT-mode services need replies from real servers to come back through
//! this host, so traffic towards a NAT destination is source-translated to
//! the node's outbound address. One rule per virtual endpoint lives in a
//! dedicated chain hooked into POSTROUTING.

use crate::model::{ForwardMode, Snapshot};
use crate::sync::{SyncError, Syncer, plan};
use async_trait::async_trait;
use std::collections::HashSet;
use std::fmt;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

/// SNAT for connections balanced through one virtual endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SnatRule {
    pub vip: Ipv4Addr,
    pub port: u16,
    pub to_source: Ipv4Addr,
}

impl fmt::Display for SnatRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{} -> {}", self.vip, self.port, self.to_source)
    }
}

/// Access to the NAT chain.
#[async_trait]
pub trait Firewall: Send + Sync {
    /// Create the chain and hook it into POSTROUTING if missing.
    async fn ensure_chain(&self) -> Result<(), SyncError>;

    async fn rules(&self) -> Result<Vec<SnatRule>, SyncError>;
    async fn add_rule(&self, rule: &SnatRule) -> Result<(), SyncError>;
    async fn delete_rule(&self, rule: &SnatRule) -> Result<(), SyncError>;
}

pub struct FirewallSyncer<F> {
    firewall: Arc<F>,
    /// Outbound address replies are translated to.
    to_source: Option<Ipv4Addr>,
    lock: Mutex<()>,
}

impl<F: Firewall> FirewallSyncer<F> {
    /// Prepare the chain and build the synchronizer.
    pub async fn new(firewall: Arc<F>, to_source: Option<Ipv4Addr>) -> Result<Self, SyncError> {
        firewall.ensure_chain().await?;
        Ok(Self {
            firewall,
            to_source,
            lock: Mutex::new(()),
        })
    }

    fn desired(&self, state: &Snapshot) -> Result<HashSet<SnatRule>, SyncError> {
        let mut rules = HashSet::new();
        for svc in &state.services {
            if svc.mode != ForwardMode::Nat {
                continue;
            }
            let Some(vip) = svc.address else {
                continue;
            };
            let to_source = self.to_source.ok_or_else(|| {
                SyncError::Rejected(format!(
                    "service '{}' uses nat mode but no outbound address is configured",
                    svc.name
                ))
            })?;
            rules.insert(SnatRule {
                vip,
                port: svc.port,
                to_source,
            });
        }
        Ok(rules)
    }
}

#[async_trait]
impl<F: Firewall> Syncer for FirewallSyncer<F> {
    fn name(&self) -> &'static str {
        "firewall"
    }

    async fn sync(&self, state: &Snapshot) -> Result<(), SyncError> {
        let _guard = self.lock.lock().await;

        let desired = self.desired(state)?;
        let actual: HashSet<SnatRule> = self.firewall.rules().await?.into_iter().collect();
        let plan = plan(&desired, &actual);

        for rule in &plan.to_add {
            self.firewall.add_rule(rule).await?;
            info!(rule = %rule, "added snat rule");
        }
        for rule in &plan.to_remove {
            self.firewall.delete_rule(rule).await?;
            info!(rule = %rule, "removed snat rule");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Service;
    use crate::sync::memory::MemoryFirewall;

    fn service(name: &str, vip: &str, mode: ForwardMode) -> Service {
        let mut svc = Service::new(name, 80);
        svc.address = Some(vip.parse().unwrap());
        svc.mode = mode;
        svc
    }

    fn outbound() -> Option<Ipv4Addr> {
        Some("10.0.0.2".parse().unwrap())
    }

    #[tokio::test]
    async fn test_construction_prepares_chain() {
        let firewall = Arc::new(MemoryFirewall::new());
        FirewallSyncer::new(Arc::clone(&firewall), outbound()).await.unwrap();
        assert!(firewall.chain_ready());
    }

    #[tokio::test]
    async fn test_only_nat_services_get_rules() {
        let firewall = Arc::new(MemoryFirewall::new());
        let syncer = FirewallSyncer::new(Arc::clone(&firewall), outbound()).await.unwrap();
        let state = Snapshot {
            services: vec![
                service("a", "192.168.0.1", ForwardMode::Nat),
                service("b", "192.168.0.2", ForwardMode::Route),
            ],
            ..Default::default()
        };

        syncer.sync(&state).await.unwrap();
        assert_eq!(
            firewall.rules_now(),
            vec![SnatRule {
                vip: "192.168.0.1".parse().unwrap(),
                port: 80,
                to_source: "10.0.0.2".parse().unwrap(),
            }]
        );

        firewall.clear_ops();
        syncer.sync(&state).await.unwrap();
        assert_eq!(firewall.mutations(), 0);
    }

    #[tokio::test]
    async fn test_rule_removed_with_service() {
        let firewall = Arc::new(MemoryFirewall::new());
        let syncer = FirewallSyncer::new(Arc::clone(&firewall), outbound()).await.unwrap();
        let mut state = Snapshot {
            services: vec![service("a", "192.168.0.1", ForwardMode::Nat)],
            ..Default::default()
        };
        syncer.sync(&state).await.unwrap();

        state.services.clear();
        syncer.sync(&state).await.unwrap();
        assert!(firewall.rules_now().is_empty());
        assert_eq!(firewall.mutations(), 2);
    }

    #[tokio::test]
    async fn test_nat_without_outbound_address_fails() {
        let firewall = Arc::new(MemoryFirewall::new());
        let syncer = FirewallSyncer::new(Arc::clone(&firewall), None).await.unwrap();
        let state = Snapshot {
            services: vec![service("a", "192.168.0.1", ForwardMode::Nat)],
            ..Default::default()
        };
        assert!(syncer.sync(&state).await.is_err());
    }
}
