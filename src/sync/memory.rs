//! In-process backends.
//!
//! Each backend keeps its table in memory and appends every mutation to a
//! journal, so tests can assert exactly what a sync pass changed. A backend
//! can be told to fail, which makes every further call return
//! [`SyncError::Rejected`].

use crate::sync::{
    Firewall, InterfaceAddrs, KernelLb, KernelService, RealServer, RouteSpeaker, ServiceKey,
    SnatRule, SyncError, VirtualService,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::net::Ipv4Addr;

#[derive(Debug, Default)]
struct Journal {
    ops: Mutex<Vec<String>>,
    failure: Mutex<Option<String>>,
}

impl Journal {
    fn check(&self) -> Result<(), SyncError> {
        match self.failure.lock().as_ref() {
            Some(reason) => Err(SyncError::Rejected(reason.clone())),
            None => Ok(()),
        }
    }

    fn record(&self, op: String) {
        self.ops.lock().push(op);
    }
}

macro_rules! journal_accessors {
    ($ty:ty) => {
        impl $ty {
            /// Every mutation applied so far, oldest first.
            pub fn ops(&self) -> Vec<String> {
                self.journal.ops.lock().clone()
            }

            pub fn mutations(&self) -> usize {
                self.journal.ops.lock().len()
            }

            pub fn clear_ops(&self) {
                self.journal.ops.lock().clear();
            }

            /// Make every call fail with `reason`, or succeed again with `None`.
            pub fn set_failure(&self, reason: Option<&str>) {
                *self.journal.failure.lock() = reason.map(str::to_string);
            }
        }
    };
}

/// Kernel LB table.
#[derive(Debug, Default)]
pub struct MemoryKernel {
    table: Mutex<BTreeMap<ServiceKey, KernelService>>,
    journal: Journal,
}

journal_accessors!(MemoryKernel);

impl MemoryKernel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Put an entry in place without journaling it.
    pub fn insert(&self, entry: KernelService) {
        self.table.lock().insert(entry.service.key(), entry);
    }

    pub fn table(&self) -> Vec<KernelService> {
        self.table.lock().values().cloned().collect()
    }

    pub fn service(&self, key: &ServiceKey) -> Option<KernelService> {
        self.table.lock().get(key).cloned()
    }
}

#[async_trait]
impl KernelLb for MemoryKernel {
    async fn services(&self) -> Result<Vec<KernelService>, SyncError> {
        self.journal.check()?;
        Ok(self.table())
    }

    async fn add_service(&self, svc: &VirtualService) -> Result<(), SyncError> {
        self.journal.check()?;
        let mut table = self.table.lock();
        if table.contains_key(&svc.key()) {
            return Err(SyncError::Rejected(format!("{} already exists", svc)));
        }
        table.insert(
            svc.key(),
            KernelService {
                service: svc.clone(),
                destinations: Vec::new(),
            },
        );
        self.journal.record(format!("add service {}", svc));
        Ok(())
    }

    async fn update_service(&self, svc: &VirtualService) -> Result<(), SyncError> {
        self.journal.check()?;
        let mut table = self.table.lock();
        let entry = table
            .get_mut(&svc.key())
            .ok_or_else(|| SyncError::Rejected(format!("{} does not exist", svc)))?;
        entry.service = svc.clone();
        self.journal.record(format!("update service {}", svc));
        Ok(())
    }

    async fn delete_service(&self, svc: &VirtualService) -> Result<(), SyncError> {
        self.journal.check()?;
        if self.table.lock().remove(&svc.key()).is_none() {
            return Err(SyncError::Rejected(format!("{} does not exist", svc)));
        }
        self.journal.record(format!("delete service {}", svc));
        Ok(())
    }

    async fn add_destination(
        &self,
        svc: &VirtualService,
        dst: &RealServer,
    ) -> Result<(), SyncError> {
        self.journal.check()?;
        let mut table = self.table.lock();
        let entry = table
            .get_mut(&svc.key())
            .ok_or_else(|| SyncError::Rejected(format!("{} does not exist", svc)))?;
        if entry.destinations.iter().any(|d| d.key() == dst.key()) {
            return Err(SyncError::Rejected(format!("{} already exists", dst)));
        }
        entry.destinations.push(dst.clone());
        self.journal.record(format!("add destination {} -> {}", svc, dst));
        Ok(())
    }

    async fn update_destination(
        &self,
        svc: &VirtualService,
        dst: &RealServer,
    ) -> Result<(), SyncError> {
        self.journal.check()?;
        let mut table = self.table.lock();
        let current = table
            .get_mut(&svc.key())
            .and_then(|entry| entry.destinations.iter_mut().find(|d| d.key() == dst.key()))
            .ok_or_else(|| SyncError::Rejected(format!("{} does not exist", dst)))?;
        *current = dst.clone();
        self.journal.record(format!("update destination {} -> {}", svc, dst));
        Ok(())
    }

    async fn delete_destination(
        &self,
        svc: &VirtualService,
        dst: &RealServer,
    ) -> Result<(), SyncError> {
        self.journal.check()?;
        let mut table = self.table.lock();
        let entry = table
            .get_mut(&svc.key())
            .ok_or_else(|| SyncError::Rejected(format!("{} does not exist", svc)))?;
        let before = entry.destinations.len();
        entry.destinations.retain(|d| d.key() != dst.key());
        if entry.destinations.len() == before {
            return Err(SyncError::Rejected(format!("{} does not exist", dst)));
        }
        self.journal.record(format!("delete destination {} -> {}", svc, dst));
        Ok(())
    }
}

/// NAT chain holding SNAT rules.
#[derive(Debug, Default)]
pub struct MemoryFirewall {
    rules: Mutex<BTreeSet<SnatRule>>,
    chain_ready: Mutex<bool>,
    journal: Journal,
}

journal_accessors!(MemoryFirewall);

impl MemoryFirewall {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, rule: SnatRule) {
        self.rules.lock().insert(rule);
    }

    pub fn rules_now(&self) -> Vec<SnatRule> {
        self.rules.lock().iter().copied().collect()
    }

    pub fn chain_ready(&self) -> bool {
        *self.chain_ready.lock()
    }
}

#[async_trait]
impl Firewall for MemoryFirewall {
    async fn ensure_chain(&self) -> Result<(), SyncError> {
        self.journal.check()?;
        *self.chain_ready.lock() = true;
        Ok(())
    }

    async fn rules(&self) -> Result<Vec<SnatRule>, SyncError> {
        self.journal.check()?;
        Ok(self.rules_now())
    }

    async fn add_rule(&self, rule: &SnatRule) -> Result<(), SyncError> {
        self.journal.check()?;
        self.rules.lock().insert(*rule);
        self.journal.record(format!("add rule {}", rule));
        Ok(())
    }

    async fn delete_rule(&self, rule: &SnatRule) -> Result<(), SyncError> {
        self.journal.check()?;
        if !self.rules.lock().remove(rule) {
            return Err(SyncError::Rejected(format!("rule {} does not exist", rule)));
        }
        self.journal.record(format!("delete rule {}", rule));
        Ok(())
    }
}

/// Addresses bound to the local interface.
#[derive(Debug, Default)]
pub struct MemoryInterface {
    addresses: Mutex<BTreeSet<Ipv4Addr>>,
    announced: Mutex<Vec<Ipv4Addr>>,
    journal: Journal,
}

journal_accessors!(MemoryInterface);

impl MemoryInterface {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, address: Ipv4Addr) {
        self.addresses.lock().insert(address);
    }

    pub fn addresses_now(&self) -> Vec<Ipv4Addr> {
        self.addresses.lock().iter().copied().collect()
    }

    /// Every address a gratuitous ARP was sent for, oldest first.
    pub fn announced(&self) -> Vec<Ipv4Addr> {
        self.announced.lock().clone()
    }
}

#[async_trait]
impl InterfaceAddrs for MemoryInterface {
    async fn addresses(&self) -> Result<HashSet<Ipv4Addr>, SyncError> {
        self.journal.check()?;
        Ok(self.addresses.lock().iter().copied().collect())
    }

    async fn add_address(&self, address: Ipv4Addr) -> Result<(), SyncError> {
        self.journal.check()?;
        self.addresses.lock().insert(address);
        self.journal.record(format!("add address {}", address));
        Ok(())
    }

    async fn remove_address(&self, address: Ipv4Addr) -> Result<(), SyncError> {
        self.journal.check()?;
        if !self.addresses.lock().remove(&address) {
            return Err(SyncError::Rejected(format!("{} is not bound", address)));
        }
        self.journal.record(format!("remove address {}", address));
        Ok(())
    }

    async fn announce(&self, address: Ipv4Addr) -> Result<(), SyncError> {
        self.journal.check()?;
        self.announced.lock().push(address);
        Ok(())
    }
}

/// Routes advertised by the local routing daemon.
#[derive(Debug, Default)]
pub struct MemoryRoutes {
    routes: Mutex<BTreeSet<Ipv4Addr>>,
    journal: Journal,
}

journal_accessors!(MemoryRoutes);

impl MemoryRoutes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, address: Ipv4Addr) {
        self.routes.lock().insert(address);
    }

    pub fn routes_now(&self) -> Vec<Ipv4Addr> {
        self.routes.lock().iter().copied().collect()
    }
}

#[async_trait]
impl RouteSpeaker for MemoryRoutes {
    async fn routes(&self) -> Result<HashSet<Ipv4Addr>, SyncError> {
        self.journal.check()?;
        Ok(self.routes.lock().iter().copied().collect())
    }

    async fn announce(&self, address: Ipv4Addr) -> Result<(), SyncError> {
        self.journal.check()?;
        self.routes.lock().insert(address);
        self.journal.record(format!("announce {}/32", address));
        Ok(())
    }

    async fn withdraw(&self, address: Ipv4Addr) -> Result<(), SyncError> {
        self.journal.check()?;
        if !self.routes.lock().remove(&address) {
            return Err(SyncError::Rejected(format!("{}/32 is not announced", address)));
        }
        self.journal.record(format!("withdraw {}/32", address));
        Ok(())
    }
}
