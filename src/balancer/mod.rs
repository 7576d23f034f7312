//! The orchestrator.
//!
//! `Balancer` owns the State Model and wires the store, leader election,
//! allocator, health monitor and synchronizers together. Mutations are
//! validated here and persisted to the store; the State Model only changes
//! when the store's change events come back, and every change triggers a
//! reconcile pass.

mod leader;
mod reconcile;
mod seed;
mod undo;
mod watch;

use crate::config::Config;
use crate::error::{EntityKind, Error, Result};
use crate::health::HealthMonitor;
use crate::ipam::VipAllocator;
use crate::metrics::MetricsCollector;
use crate::model::{
    CheckSpec, Destination, Service, Snapshot, State, validate_check, validate_destination,
    validate_service,
};
use crate::store::{LeaderElection, Store, StoreError};
use crate::sync::{Syncer, VipOwner};
use crate::util::ShutdownSignal;
use cidr::Ipv4Cidr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use undo::Steps;

/// How virtual addresses reach the network.
pub enum Addressing {
    /// The leader binds every VIP to its interface.
    Unicast(Arc<dyn VipOwner>),
    /// Every node announces every VIP as a host route.
    Anycast(Arc<dyn Syncer>),
}

impl Addressing {
    fn name(&self) -> &'static str {
        match self {
            Addressing::Unicast(_) => "unicast",
            Addressing::Anycast(_) => "anycast",
        }
    }
}

/// External collaborators of a balancer.
pub struct Components {
    pub store: Arc<dyn Store>,
    pub election: Arc<dyn LeaderElection>,
    /// Kernel LB table synchronizer.
    pub kernel: Arc<dyn Syncer>,
    /// SNAT rule synchronizer.
    pub firewall: Arc<dyn Syncer>,
    pub addressing: Addressing,
    pub metrics: MetricsCollector,
}

/// Tunables of a balancer.
#[derive(Debug, Clone)]
pub struct Settings {
    pub vip_ranges: Vec<Ipv4Cidr>,
    /// Applied to check specs without an interval.
    pub check_interval: Duration,
    /// Applied to check specs without a timeout.
    pub check_timeout: Duration,
    pub metrics_interval: Duration,
    /// How long seeding waits for a new service to reach the State Model.
    pub propagation_timeout: Duration,
}

impl Settings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            vip_ranges: config.node.vip_ranges.clone(),
            check_interval: config.health_check_defaults.interval,
            check_timeout: config.health_check_defaults.timeout,
            metrics_interval: config.node.metrics_interval,
            ..Self::default()
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            vip_ranges: Vec::new(),
            check_interval: Duration::from_secs(10),
            check_timeout: Duration::from_secs(5),
            metrics_interval: Duration::from_secs(15),
            propagation_timeout: Duration::from_secs(5),
        }
    }
}

pub struct Balancer {
    state: Arc<State>,
    store: Arc<dyn Store>,
    election: Arc<dyn LeaderElection>,
    ipam: VipAllocator,
    kernel: Arc<dyn Syncer>,
    firewall: Arc<dyn Syncer>,
    addressing: Addressing,
    health: HealthMonitor,
    metrics: MetricsCollector,
    settings: Settings,
    leader: AtomicBool,
    /// Serializes the check-then-persist section of add operations.
    add_lock: Mutex<()>,
    /// Held for a whole reconcile pass and for leadership transitions.
    reconcile_lock: Mutex<()>,
    trigger: Notify,
    shutdown: ShutdownSignal,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl Balancer {
    /// Build a balancer and bring it to its first converged state.
    ///
    /// Stale VIPs are flushed from the interface first. The background
    /// loops are started next, then the State Model is loaded from the
    /// store and one reconcile pass runs before this returns.
    pub async fn start(settings: Settings, components: Components) -> Result<Arc<Self>> {
        let state = Arc::new(State::new());
        let metrics = components.metrics;
        let balancer = Arc::new(Self {
            ipam: VipAllocator::new(settings.vip_ranges.clone(), Arc::clone(&state)),
            health: HealthMonitor::new(
                metrics.clone(),
                settings.check_interval,
                settings.check_timeout,
            ),
            state,
            store: components.store,
            election: components.election,
            kernel: components.kernel,
            firewall: components.firewall,
            addressing: components.addressing,
            metrics,
            settings,
            leader: AtomicBool::new(false),
            add_lock: Mutex::new(()),
            reconcile_lock: Mutex::new(()),
            trigger: Notify::new(),
            shutdown: ShutdownSignal::new(),
            tasks: parking_lot::Mutex::new(Vec::new()),
        });

        info!(mode = balancer.addressing.name(), "starting balancer");
        if let Addressing::Unicast(iface) = &balancer.addressing {
            match iface.flush().await {
                Ok(0) => {}
                Ok(removed) => info!(removed, "flushed stale vips"),
                Err(e) => warn!(error = %e, "failed to flush stale vips"),
            }
        }

        // Subscribe before the initial load so no change slips between them.
        let events = watch::StoreEvents::subscribe(balancer.store.as_ref());
        let elections = balancer.election.run_for_election().await?;

        balancer.spawn(leader::run(Arc::clone(&balancer), elections));
        balancer.spawn(watch::run(Arc::clone(&balancer), events));
        balancer.spawn(watch::run_health(Arc::clone(&balancer)));
        balancer.spawn(reconcile::run(Arc::clone(&balancer)));
        balancer.spawn(reconcile::run_metrics(Arc::clone(&balancer)));

        balancer.load().await?;
        if let Err(e) = balancer.reconcile().await {
            warn!(module = e.module, "initial reconcile incomplete, retrying on next change");
        }

        info!(
            services = balancer.state.service_count(),
            destinations = balancer.state.destination_count(),
            "balancer ready"
        );
        Ok(balancer)
    }

    fn spawn<F>(&self, task: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.tasks.lock().push(tokio::spawn(task));
    }

    /// Replace the State Model with the store's collections.
    async fn load(&self) -> Result<()> {
        let services = self.store.get_services().await?;
        let destinations = self.store.get_destinations().await?;
        let checks = self.store.get_checks().await?;
        self.state.replace_services(services);
        self.state.replace_destinations(destinations);
        self.state.replace_checks(checks);
        self.health.update(&self.state.snapshot());
        Ok(())
    }

    /// Allocate a VIP for `svc` and persist it.
    ///
    /// The State Model picks the service up from the store's change event,
    /// so it is not visible to reads when this returns.
    pub async fn add_service(&self, mut svc: Service) -> Result<Service> {
        validate_service(&svc)?;

        let _guard = self.add_lock.lock().await;
        if self.state.get_service(&svc.name).is_some() {
            return Err(Error::conflict(EntityKind::Service, &svc.name));
        }

        let mut steps = Steps::new();
        let allocated = self.ipam.allocate_vip(&mut svc);
        self.metrics.record_vip_allocation(allocated.is_ok());
        let vip = allocated?;
        let allocation = svc.clone();
        let ipam = &self.ipam;
        steps.committed("allocate vip", async move { ipam.release_vip(&allocation) });

        if let Err(e) = self.store.add_service(&svc).await {
            steps.unwind().await;
            return Err(Error::from_store(e, EntityKind::Service, &svc.name));
        }

        info!(service = %svc.name, vip = %vip, port = svc.port, "service added");
        Ok(svc)
    }

    /// Delete a service together with its destinations and checks.
    ///
    /// Children are read from the store, since entries added moments ago
    /// may not have reached the State Model yet.
    pub async fn delete_service(&self, name: &str) -> Result<()> {
        let svc = self
            .state
            .get_service(name)
            .ok_or_else(|| Error::service_not_found(name))?;

        let _guard = self.add_lock.lock().await;
        let destinations = self.store.get_destinations().await?;
        for dst in destinations.iter().filter(|d| d.service_id == name) {
            ignore_missing(self.store.delete_destination(&dst.name).await)?;
        }
        let checks = self.store.get_checks().await?;
        for spec in checks.iter().filter(|c| c.service_id == name) {
            ignore_missing(self.store.delete_check(&spec.id).await)?;
        }
        self.store
            .delete_service(name)
            .await
            .map_err(|e| Error::from_store(e, EntityKind::Service, name))?;
        self.ipam.release_vip(&svc);

        info!(service = %name, "service deleted");
        Ok(())
    }

    /// Bind `dst` to `service` and persist it.
    pub async fn add_destination(&self, service: &str, mut dst: Destination) -> Result<Destination> {
        dst.service_id = service.to_string();
        validate_destination(&dst)?;

        let _guard = self.add_lock.lock().await;
        if self.state.get_service(service).is_none() {
            return Err(Error::service_not_found(service));
        }
        if self.state.get_destination(&dst.name).is_some() {
            return Err(Error::conflict(EntityKind::Destination, &dst.name));
        }
        let duplicate = self
            .state
            .get_destinations(service)
            .iter()
            .any(|d| d.address == dst.address && d.port == dst.port);
        if duplicate {
            return Err(Error::conflict(
                EntityKind::Destination,
                dst.socket_addr().to_string(),
            ));
        }

        self.store
            .add_destination(&dst)
            .await
            .map_err(|e| Error::from_store(e, EntityKind::Destination, &dst.name))?;

        info!(
            service = %service,
            destination = %dst.name,
            target = %dst.socket_addr(),
            "destination added"
        );
        Ok(dst)
    }

    pub async fn delete_destination(&self, name: &str) -> Result<()> {
        let dst = self
            .state
            .get_destination(name)
            .ok_or_else(|| Error::destination_not_found(name))?;
        if self.state.get_service(&dst.service_id).is_none() {
            return Err(Error::service_not_found(&dst.service_id));
        }

        self.store
            .delete_destination(name)
            .await
            .map_err(|e| Error::from_store(e, EntityKind::Destination, name))?;

        info!(service = %dst.service_id, destination = %name, "destination deleted");
        Ok(())
    }

    /// Persist a check spec, filling in the default interval, timeout and
    /// id. A spec with an existing id replaces it.
    pub async fn add_check(&self, mut spec: CheckSpec) -> Result<CheckSpec> {
        spec.apply_defaults(self.settings.check_interval, self.settings.check_timeout);
        validate_check(&spec)?;

        let _guard = self.add_lock.lock().await;
        if self.state.get_service(&spec.service_id).is_none() {
            return Err(Error::service_not_found(&spec.service_id));
        }
        self.store
            .add_check(&spec)
            .await
            .map_err(|e| Error::from_store(e, EntityKind::Check, &spec.id))?;

        info!(service = %spec.service_id, check = %spec.id, kind = spec.probe.kind(), "check added");
        Ok(spec)
    }

    pub async fn delete_check(&self, id: &str) -> Result<()> {
        let not_found = || Error::NotFound {
            kind: EntityKind::Check,
            name: id.to_string(),
        };
        if !self.state.get_checks().iter().any(|c| c.id == id) {
            return Err(not_found());
        }
        self.store
            .delete_check(id)
            .await
            .map_err(|e| Error::from_store(e, EntityKind::Check, id))?;

        info!(check = %id, "check deleted");
        Ok(())
    }

    pub fn get_services(&self) -> Vec<Service> {
        self.state.get_services()
    }

    pub fn get_service(&self, name: &str) -> Result<Service> {
        self.state
            .get_service(name)
            .ok_or_else(|| Error::service_not_found(name))
    }

    /// Destinations of `service`, sorted by name.
    pub fn get_destinations(&self, service: &str) -> Result<Vec<Destination>> {
        if self.state.get_service(service).is_none() {
            return Err(Error::service_not_found(service));
        }
        Ok(self.state.get_destinations(service))
    }

    pub fn get_destination(&self, name: &str) -> Result<Destination> {
        self.state
            .get_destination(name)
            .ok_or_else(|| Error::destination_not_found(name))
    }

    pub fn get_checks(&self) -> Vec<CheckSpec> {
        self.state.get_checks()
    }

    /// Copy of the State Model.
    pub fn snapshot(&self) -> Snapshot {
        self.state.snapshot()
    }

    /// Whether this node currently acts as leader.
    pub fn is_leader(&self) -> bool {
        self.leader.load(Ordering::Acquire)
    }

    pub fn health(&self) -> &HealthMonitor {
        &self.health
    }

    /// Wait until `predicate` holds for the State Model, or `timeout` passes.
    pub async fn wait_until<F>(&self, timeout: Duration, predicate: F) -> bool
    where
        F: FnMut(&State) -> bool,
    {
        self.state.wait_until(timeout, predicate).await
    }

    /// Swap the VIP pools. Existing services keep their addresses.
    pub fn set_vip_ranges(&self, ranges: Vec<Ipv4Cidr>) {
        self.ipam.set_ranges(ranges);
    }

    /// Stop checks and background loops, release held VIPs and resign.
    pub async fn shutdown(&self) {
        info!("balancer shutting down");
        self.shutdown.shutdown();

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        self.health.stop_all();

        if let Addressing::Unicast(iface) = &self.addressing {
            if self.is_leader() {
                if let Err(e) = iface.flush().await {
                    warn!(error = %e, "failed to release vips");
                }
            }
        }
        self.leader.store(false, Ordering::Release);
        self.metrics.set_leader(false);

        if let Err(e) = self.election.resign().await {
            warn!(error = %e, "failed to resign leadership");
        }
        info!("balancer stopped");
    }
}

/// Cascading deletes race with other deleters; a key that is already gone
/// is fine.
fn ignore_missing(result: std::result::Result<(), StoreError>) -> Result<()> {
    match result {
        Err(StoreError::KeyNotFound(_)) => Ok(()),
        other => other.map_err(Error::from),
    }
}
