//! In-process implementation of the coordination store.

use crate::model::{CheckSpec, Destination, Service};
use crate::store::{ElectionKey, LeaderElection, MemoryElection, Store, StoreError};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::broadcast;
use tracing::debug;

/// Capacity of each change-event channel.
const EVENT_CAPACITY: usize = 64;

/// Store keeping every collection in memory and broadcasting changes.
pub struct MemoryStore {
    data: RwLock<Collections>,
    services_tx: broadcast::Sender<Vec<Service>>,
    destinations_tx: broadcast::Sender<Vec<Destination>>,
    checks_tx: broadcast::Sender<Vec<CheckSpec>>,
    election: Arc<ElectionKey>,
    /// Fails every write while set, to exercise error paths.
    unavailable: AtomicBool,
}

#[derive(Default)]
struct Collections {
    services: BTreeMap<String, Service>,
    destinations: BTreeMap<String, Destination>,
    checks: BTreeMap<String, CheckSpec>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_election(Arc::new(ElectionKey::new()))
    }

    /// Share an election key, so several stores behave like one cluster.
    pub fn with_election(election: Arc<ElectionKey>) -> Self {
        let (services_tx, _) = broadcast::channel(EVENT_CAPACITY);
        let (destinations_tx, _) = broadcast::channel(EVENT_CAPACITY);
        let (checks_tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            data: RwLock::new(Collections::default()),
            services_tx,
            destinations_tx,
            checks_tx,
            election,
            unavailable: AtomicBool::new(false),
        }
    }

    /// The election key shared by every candidate of this store.
    pub fn election_key(&self) -> &Arc<ElectionKey> {
        &self.election
    }

    /// Toggle simulated unavailability for writes.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::Release);
    }

    fn ensure_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::Acquire) {
            Err(StoreError::Unavailable("writes disabled".to_string()))
        } else {
            Ok(())
        }
    }

    fn publish_services(&self, data: &Collections) {
        let _ = self
            .services_tx
            .send(data.services.values().cloned().collect());
    }

    fn publish_destinations(&self, data: &Collections) {
        let _ = self
            .destinations_tx
            .send(data.destinations.values().cloned().collect());
    }

    fn publish_checks(&self, data: &Collections) {
        let _ = self.checks_tx.send(data.checks.values().cloned().collect());
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_services(&self) -> Result<Vec<Service>, StoreError> {
        Ok(self.data.read().services.values().cloned().collect())
    }

    async fn get_destinations(&self) -> Result<Vec<Destination>, StoreError> {
        Ok(self.data.read().destinations.values().cloned().collect())
    }

    async fn get_checks(&self) -> Result<Vec<CheckSpec>, StoreError> {
        Ok(self.data.read().checks.values().cloned().collect())
    }

    fn subscribe_services(&self) -> broadcast::Receiver<Vec<Service>> {
        self.services_tx.subscribe()
    }

    fn subscribe_destinations(&self) -> broadcast::Receiver<Vec<Destination>> {
        self.destinations_tx.subscribe()
    }

    fn subscribe_checks(&self) -> broadcast::Receiver<Vec<CheckSpec>> {
        self.checks_tx.subscribe()
    }

    async fn add_service(&self, svc: &Service) -> Result<(), StoreError> {
        self.ensure_available()?;
        let mut data = self.data.write();
        if data.services.contains_key(&svc.name) {
            return Err(StoreError::KeyExists(svc.name.clone()));
        }
        data.services.insert(svc.name.clone(), svc.clone());
        debug!(service = %svc.name, "stored service");
        self.publish_services(&data);
        Ok(())
    }

    async fn delete_service(&self, name: &str) -> Result<(), StoreError> {
        self.ensure_available()?;
        let mut data = self.data.write();
        if data.services.remove(name).is_none() {
            return Err(StoreError::KeyNotFound(name.to_string()));
        }
        self.publish_services(&data);
        Ok(())
    }

    async fn add_destination(&self, dst: &Destination) -> Result<(), StoreError> {
        self.ensure_available()?;
        let mut data = self.data.write();
        if data.destinations.contains_key(&dst.name) {
            return Err(StoreError::KeyExists(dst.name.clone()));
        }
        data.destinations.insert(dst.name.clone(), dst.clone());
        debug!(destination = %dst.name, service = %dst.service_id, "stored destination");
        self.publish_destinations(&data);
        Ok(())
    }

    async fn delete_destination(&self, name: &str) -> Result<(), StoreError> {
        self.ensure_available()?;
        let mut data = self.data.write();
        if data.destinations.remove(name).is_none() {
            return Err(StoreError::KeyNotFound(name.to_string()));
        }
        self.publish_destinations(&data);
        Ok(())
    }

    async fn add_check(&self, spec: &CheckSpec) -> Result<(), StoreError> {
        self.ensure_available()?;
        let mut data = self.data.write();
        data.checks.insert(spec.id.clone(), spec.clone());
        self.publish_checks(&data);
        Ok(())
    }

    async fn delete_check(&self, id: &str) -> Result<(), StoreError> {
        self.ensure_available()?;
        let mut data = self.data.write();
        if data.checks.remove(id).is_none() {
            return Err(StoreError::KeyNotFound(id.to_string()));
        }
        self.publish_checks(&data);
        Ok(())
    }

    fn election(&self, node_id: &str) -> Arc<dyn LeaderElection> {
        Arc::new(MemoryElection::new(Arc::clone(&self.election), node_id))
    }
}
