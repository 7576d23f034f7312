//! Interface VIP synchronizer.
//!
//! In unicast mode exactly one node, the leader, binds the virtual
//! addresses to its interface so it answers ARP for them. Only addresses
//! carrying our label are considered managed; anything else bound to the
//! interface is left alone.

use crate::model::Snapshot;
use crate::sync::{SyncError, Syncer, plan};
use async_trait::async_trait;
use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Access to the managed addresses of the local interface.
#[async_trait]
pub trait InterfaceAddrs: Send + Sync {
    /// Managed addresses currently bound.
    async fn addresses(&self) -> Result<HashSet<Ipv4Addr>, SyncError>;

    async fn add_address(&self, address: Ipv4Addr) -> Result<(), SyncError>;
    async fn remove_address(&self, address: Ipv4Addr) -> Result<(), SyncError>;

    /// Send a gratuitous ARP so neighbours update their caches.
    async fn announce(&self, address: Ipv4Addr) -> Result<(), SyncError>;
}

/// A synchronizer for addresses only the leader may hold.
#[async_trait]
pub trait VipOwner: Syncer {
    /// Remove every managed address. Returns how many were removed.
    async fn flush(&self) -> Result<usize, SyncError>;

    /// Gratuitously announce every address of `state`.
    async fn announce_all(&self, state: &Snapshot) -> Result<(), SyncError>;
}

pub struct InterfaceSyncer<I> {
    interface: Arc<I>,
    lock: Mutex<()>,
}

impl<I: InterfaceAddrs> InterfaceSyncer<I> {
    pub fn new(interface: Arc<I>) -> Self {
        Self {
            interface,
            lock: Mutex::new(()),
        }
    }
}

#[async_trait]
impl<I: InterfaceAddrs> Syncer for InterfaceSyncer<I> {
    fn name(&self) -> &'static str {
        "interface"
    }

    async fn sync(&self, state: &Snapshot) -> Result<(), SyncError> {
        let _guard = self.lock.lock().await;

        let desired: HashSet<Ipv4Addr> = state.vips().collect();
        let actual = self.interface.addresses().await?;
        let plan = plan(&desired, &actual);

        for address in &plan.to_add {
            self.interface.add_address(*address).await?;
            info!(vip = %address, "bound vip");
            if let Err(e) = self.interface.announce(*address).await {
                warn!(vip = %address, error = %e, "gratuitous arp failed");
            }
        }
        for address in &plan.to_remove {
            self.interface.remove_address(*address).await?;
            info!(vip = %address, "unbound vip");
        }
        Ok(())
    }
}

#[async_trait]
impl<I: InterfaceAddrs> VipOwner for InterfaceSyncer<I> {
    async fn flush(&self) -> Result<usize, SyncError> {
        let _guard = self.lock.lock().await;

        let bound = self.interface.addresses().await?;
        for address in &bound {
            self.interface.remove_address(*address).await?;
        }
        if !bound.is_empty() {
            info!(count = bound.len(), "flushed vips from interface");
        }
        Ok(bound.len())
    }

    async fn announce_all(&self, state: &Snapshot) -> Result<(), SyncError> {
        for address in state.vips() {
            self.interface.announce(address).await?;
        }
        Ok(())
    }
}
