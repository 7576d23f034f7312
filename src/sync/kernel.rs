//! Kernel load-balancing table synchronizer.
//!
//! Virtual services are identified by address, port and protocol, real
//! servers by address and port within their service. An entry whose key
//! matches but whose attributes differ (scheduler, persistence, weight,
//! forwarding method) is edited in place rather than deleted and re-added,
//! so established connections survive a weight change.

use crate::model::{ForwardMode, Protocol, Scheduler, Snapshot};
use crate::sync::{SyncError, Syncer, plan};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Identity of a virtual service in the kernel table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceKey {
    pub address: Ipv4Addr,
    pub port: u16,
    pub protocol: Protocol,
}

/// A virtual service as the kernel sees it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VirtualService {
    pub address: Ipv4Addr,
    pub port: u16,
    pub protocol: Protocol,
    pub scheduler: Scheduler,
    /// Persistence timeout in seconds, 0 when disabled.
    pub persistent: u32,
}

impl VirtualService {
    pub fn key(&self) -> ServiceKey {
        ServiceKey {
            address: self.address,
            port: self.port,
            protocol: self.protocol,
        }
    }
}

impl fmt::Display for VirtualService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}:{}", self.protocol, self.address, self.port)
    }
}

/// A real server behind a virtual service.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RealServer {
    pub address: Ipv4Addr,
    pub port: u16,
    pub weight: u32,
    pub mode: ForwardMode,
}

impl RealServer {
    pub fn key(&self) -> (Ipv4Addr, u16) {
        (self.address, self.port)
    }
}

impl fmt::Display for RealServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

/// A virtual service together with its real servers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelService {
    pub service: VirtualService,
    pub destinations: Vec<RealServer>,
}

/// Access to the kernel load-balancing table.
#[async_trait]
pub trait KernelLb: Send + Sync {
    /// Every IPv4 TCP/UDP virtual service with its real servers.
    async fn services(&self) -> Result<Vec<KernelService>, SyncError>;

    async fn add_service(&self, svc: &VirtualService) -> Result<(), SyncError>;
    async fn update_service(&self, svc: &VirtualService) -> Result<(), SyncError>;
    /// Removes the service together with its real servers.
    async fn delete_service(&self, svc: &VirtualService) -> Result<(), SyncError>;

    async fn add_destination(
        &self,
        svc: &VirtualService,
        dst: &RealServer,
    ) -> Result<(), SyncError>;
    async fn update_destination(
        &self,
        svc: &VirtualService,
        dst: &RealServer,
    ) -> Result<(), SyncError>;
    async fn delete_destination(
        &self,
        svc: &VirtualService,
        dst: &RealServer,
    ) -> Result<(), SyncError>;
}

/// Converges the kernel table to every service with an allocated address.
pub struct KernelSyncer<K> {
    kernel: Arc<K>,
    lock: Mutex<()>,
}

impl<K: KernelLb> KernelSyncer<K> {
    pub fn new(kernel: Arc<K>) -> Self {
        Self {
            kernel,
            lock: Mutex::new(()),
        }
    }

    async fn sync_destinations(
        &self,
        svc: &VirtualService,
        desired: &[RealServer],
        actual: &[RealServer],
    ) -> Result<(), SyncError> {
        let want: HashSet<RealServer> = desired.iter().cloned().collect();
        let have: HashSet<RealServer> = actual.iter().cloned().collect();
        let plan = plan(&want, &have);

        let existing: HashSet<(Ipv4Addr, u16)> = actual.iter().map(RealServer::key).collect();
        let mut edited = HashSet::new();

        for dst in &plan.to_add {
            if existing.contains(&dst.key()) {
                self.kernel.update_destination(svc, dst).await?;
                edited.insert(dst.key());
                debug!(service = %svc, destination = %dst, weight = dst.weight, "updated real server");
            } else {
                self.kernel.add_destination(svc, dst).await?;
                info!(service = %svc, destination = %dst, "added real server");
            }
        }

        for dst in &plan.to_remove {
            if edited.contains(&dst.key()) {
                continue;
            }
            self.kernel.delete_destination(svc, dst).await?;
            info!(service = %svc, destination = %dst, "removed real server");
        }

        Ok(())
    }
}

/// Kernel entries wanted for `state`, keyed by service identity.
fn desired_table(state: &Snapshot) -> HashMap<ServiceKey, KernelService> {
    let mut table = HashMap::new();
    for svc in &state.services {
        let Some(address) = svc.address else {
            continue;
        };
        let service = VirtualService {
            address,
            port: svc.port,
            protocol: svc.protocol,
            scheduler: svc.scheduler,
            persistent: svc.persistent,
        };
        let destinations = state
            .destinations_for(&svc.name)
            .map(|d| RealServer {
                address: d.address,
                port: d.port,
                weight: d.weight,
                mode: d.effective_mode(svc),
            })
            .collect();
        table.insert(
            service.key(),
            KernelService {
                service,
                destinations,
            },
        );
    }
    table
}

#[async_trait]
impl<K: KernelLb> Syncer for KernelSyncer<K> {
    fn name(&self) -> &'static str {
        "kernel"
    }

    async fn sync(&self, state: &Snapshot) -> Result<(), SyncError> {
        let _guard = self.lock.lock().await;

        let desired = desired_table(state);
        let actual: HashMap<ServiceKey, KernelService> = self
            .kernel
            .services()
            .await?
            .into_iter()
            .map(|entry| (entry.service.key(), entry))
            .collect();

        let want: HashSet<VirtualService> = desired.values().map(|e| e.service.clone()).collect();
        let have: HashSet<VirtualService> = actual.values().map(|e| e.service.clone()).collect();
        let plan = plan(&want, &have);

        let mut edited = HashSet::new();
        for svc in &plan.to_add {
            if actual.contains_key(&svc.key()) {
                self.kernel.update_service(svc).await?;
                edited.insert(svc.key());
                info!(service = %svc, scheduler = %svc.scheduler, "updated virtual service");
            } else {
                self.kernel.add_service(svc).await?;
                info!(service = %svc, "added virtual service");
            }
        }

        for svc in &plan.to_remove {
            if edited.contains(&svc.key()) {
                continue;
            }
            self.kernel.delete_service(svc).await?;
            info!(service = %svc, "removed virtual service");
        }

        for (key, entry) in &desired {
            let current = actual
                .get(key)
                .map(|e| e.destinations.as_slice())
                .unwrap_or(&[]);
            self.sync_destinations(&entry.service, &entry.destinations, current)
                .await?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Destination, Service};
    use crate::sync::memory::MemoryKernel;

    fn snapshot() -> Snapshot {
        let mut svc = Service::new("web", 80);
        svc.address = Some("192.168.0.1".parse().unwrap());
        Snapshot {
            services: vec![svc],
            destinations: vec![
                Destination::new("web-1", "web", "10.0.0.1".parse().unwrap(), 8080),
                Destination::new("web-2", "web", "10.0.0.2".parse().unwrap(), 8080),
            ],
            checks: vec![],
        }
    }

    fn web_key() -> ServiceKey {
        ServiceKey {
            address: "192.168.0.1".parse().unwrap(),
            port: 80,
            protocol: Protocol::Tcp,
        }
    }

    #[tokio::test]
    async fn test_sync_creates_table_and_is_idempotent() {
        let kernel = Arc::new(MemoryKernel::new());
        let syncer = KernelSyncer::new(Arc::clone(&kernel));
        let state = snapshot();

        syncer.sync(&state).await.unwrap();
        let entry = kernel.service(&web_key()).unwrap();
        assert_eq!(entry.destinations.len(), 2);
        assert_eq!(kernel.mutations(), 3);

        kernel.clear_ops();
        syncer.sync(&state).await.unwrap();
        assert_eq!(kernel.mutations(), 0);
    }

    #[tokio::test]
    async fn test_sync_removes_stale_entries() {
        let kernel = Arc::new(MemoryKernel::new());
        kernel.insert(KernelService {
            service: VirtualService {
                address: "192.168.0.9".parse().unwrap(),
                port: 443,
                protocol: Protocol::Tcp,
                scheduler: Scheduler::Rr,
                persistent: 0,
            },
            destinations: vec![],
        });
        let syncer = KernelSyncer::new(Arc::clone(&kernel));

        syncer.sync(&snapshot()).await.unwrap();
        assert_eq!(kernel.table().len(), 1);
        assert!(kernel.ops().contains(&"delete service tcp 192.168.0.9:443".to_string()));
    }

    #[tokio::test]
    async fn test_attribute_change_edits_in_place() {
        let kernel = Arc::new(MemoryKernel::new());
        let syncer = KernelSyncer::new(Arc::clone(&kernel));
        let mut state = snapshot();
        syncer.sync(&state).await.unwrap();
        kernel.clear_ops();

        state.services[0].scheduler = Scheduler::Wrr;
        state.destinations[0].weight = 5;
        syncer.sync(&state).await.unwrap();

        assert_eq!(
            kernel.ops(),
            vec![
                "update service tcp 192.168.0.1:80".to_string(),
                "update destination tcp 192.168.0.1:80 -> 10.0.0.1:8080".to_string(),
            ]
        );
        let entry = kernel.service(&web_key()).unwrap();
        assert_eq!(entry.service.scheduler, Scheduler::Wrr);
        assert!(entry.destinations.iter().any(|d| d.weight == 5));
    }

    #[tokio::test]
    async fn test_removed_destination() {
        let kernel = Arc::new(MemoryKernel::new());
        let syncer = KernelSyncer::new(Arc::clone(&kernel));
        let mut state = snapshot();
        syncer.sync(&state).await.unwrap();
        kernel.clear_ops();

        state.destinations.pop();
        syncer.sync(&state).await.unwrap();
        assert_eq!(
            kernel.ops(),
            vec!["delete destination tcp 192.168.0.1:80 -> 10.0.0.2:8080".to_string()]
        );
    }

    #[tokio::test]
    async fn test_unallocated_services_are_skipped() {
        let kernel = Arc::new(MemoryKernel::new());
        let syncer = KernelSyncer::new(Arc::clone(&kernel));
        let mut state = snapshot();
        state.services[0].address = None;

        syncer.sync(&state).await.unwrap();
        assert!(kernel.table().is_empty());
    }

    #[tokio::test]
    async fn test_backend_failure_propagates() {
        let kernel = Arc::new(MemoryKernel::new());
        kernel.set_failure(Some("netlink down"));
        let syncer = KernelSyncer::new(Arc::clone(&kernel));

        let result = syncer.sync(&snapshot()).await;
        assert!(matches!(result, Err(SyncError::Rejected(_))));
    }
}
