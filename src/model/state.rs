//! The in-memory State Model.
//!
//! A single reader/writer lock guards all three collections so readers
//! always observe a consistent view. Every mutation bumps a version counter
//! that can be awaited by callers who need to see asynchronous propagation.

use crate::model::{CheckSpec, Destination, Service};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::time::Duration;
use tokio::sync::watch;

/// Concurrent cache of services, destinations and check specs.
#[derive(Debug)]
pub struct State {
    inner: RwLock<StateInner>,
    version: watch::Sender<u64>,
}

#[derive(Debug, Default)]
struct StateInner {
    services: HashMap<String, Service>,
    destinations: HashMap<String, Destination>,
    checks: Vec<CheckSpec>,
}

/// A point-in-time copy of the State Model.
///
/// Synchronizers converge external systems towards a snapshot, and the
/// health monitor derives its filtered view from one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    /// Services sorted by name.
    pub services: Vec<Service>,
    /// Destinations sorted by name.
    pub destinations: Vec<Destination>,
    pub checks: Vec<CheckSpec>,
}

impl Snapshot {
    /// Destinations bound to `service`.
    pub fn destinations_for<'a>(
        &'a self,
        service: &'a str,
    ) -> impl Iterator<Item = &'a Destination> + 'a {
        self.destinations
            .iter()
            .filter(move |d| d.service_id == service)
    }

    /// Allocated virtual addresses of every service.
    pub fn vips(&self) -> impl Iterator<Item = Ipv4Addr> + '_ {
        self.services.iter().filter_map(|s| s.address)
    }
}

impl State {
    pub fn new() -> Self {
        let (version, _) = watch::channel(0);
        Self {
            inner: RwLock::new(StateInner::default()),
            version,
        }
    }

    /// All services, sorted by name.
    pub fn get_services(&self) -> Vec<Service> {
        let mut services: Vec<Service> = self.inner.read().services.values().cloned().collect();
        services.sort_by(|a, b| a.name.cmp(&b.name));
        services
    }

    pub fn get_service(&self, name: &str) -> Option<Service> {
        self.inner.read().services.get(name).cloned()
    }

    /// Destinations bound to `service`, sorted by name.
    pub fn get_destinations(&self, service: &str) -> Vec<Destination> {
        let mut destinations: Vec<Destination> = self
            .inner
            .read()
            .destinations
            .values()
            .filter(|d| d.service_id == service)
            .cloned()
            .collect();
        destinations.sort_by(|a, b| a.name.cmp(&b.name));
        destinations
    }

    pub fn get_destination(&self, name: &str) -> Option<Destination> {
        self.inner.read().destinations.get(name).cloned()
    }

    pub fn get_checks(&self) -> Vec<CheckSpec> {
        self.inner.read().checks.clone()
    }

    pub fn service_count(&self) -> usize {
        self.inner.read().services.len()
    }

    pub fn destination_count(&self) -> usize {
        self.inner.read().destinations.len()
    }

    pub fn add_service(&self, svc: Service) {
        self.inner.write().services.insert(svc.name.clone(), svc);
        self.bump();
    }

    /// Remove a service together with its destinations and checks.
    pub fn delete_service(&self, name: &str) -> Option<Service> {
        let removed = {
            let mut inner = self.inner.write();
            let removed = inner.services.remove(name);
            if removed.is_some() {
                inner.destinations.retain(|_, d| d.service_id != name);
                inner.checks.retain(|c| c.service_id != name);
            }
            removed
        };
        if removed.is_some() {
            self.bump();
        }
        removed
    }

    pub fn add_destination(&self, dst: Destination) {
        self.inner
            .write()
            .destinations
            .insert(dst.name.clone(), dst);
        self.bump();
    }

    pub fn delete_destination(&self, name: &str) -> Option<Destination> {
        let removed = self.inner.write().destinations.remove(name);
        if removed.is_some() {
            self.bump();
        }
        removed
    }

    pub fn add_check(&self, spec: CheckSpec) {
        {
            let mut inner = self.inner.write();
            inner.checks.retain(|c| c.id != spec.id);
            inner.checks.push(spec);
        }
        self.bump();
    }

    pub fn delete_check(&self, id: &str) -> Option<CheckSpec> {
        let removed = {
            let mut inner = self.inner.write();
            let index = inner.checks.iter().position(|c| c.id == id);
            index.map(|i| inner.checks.remove(i))
        };
        if removed.is_some() {
            self.bump();
        }
        removed
    }

    /// Replace every service with `services` (a full collection from the store).
    pub fn replace_services(&self, services: Vec<Service>) {
        self.inner.write().services = services
            .into_iter()
            .map(|s| (s.name.clone(), s))
            .collect();
        self.bump();
    }

    pub fn replace_destinations(&self, destinations: Vec<Destination>) {
        self.inner.write().destinations = destinations
            .into_iter()
            .map(|d| (d.name.clone(), d))
            .collect();
        self.bump();
    }

    pub fn replace_checks(&self, checks: Vec<CheckSpec>) {
        self.inner.write().checks = checks;
        self.bump();
    }

    /// Copy the whole model under one read lock.
    pub fn snapshot(&self) -> Snapshot {
        let inner = self.inner.read();
        let mut services: Vec<Service> = inner.services.values().cloned().collect();
        services.sort_by(|a, b| a.name.cmp(&b.name));
        let mut destinations: Vec<Destination> = inner.destinations.values().cloned().collect();
        destinations.sort_by(|a, b| a.name.cmp(&b.name));
        Snapshot {
            services,
            destinations,
            checks: inner.checks.clone(),
        }
    }

    /// Current mutation counter.
    pub fn version(&self) -> u64 {
        *self.version.borrow()
    }

    /// Receiver that is notified after every mutation.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.version.subscribe()
    }

    /// Wait until `predicate` holds, re-evaluating after each mutation.
    ///
    /// Returns `false` if `timeout` elapses first.
    pub async fn wait_until<F>(&self, timeout: Duration, mut predicate: F) -> bool
    where
        F: FnMut(&State) -> bool,
    {
        let mut changes = self.subscribe();
        let wait = async {
            loop {
                if predicate(self) {
                    return true;
                }
                if changes.changed().await.is_err() {
                    return predicate(self);
                }
            }
        };
        tokio::time::timeout(timeout, wait).await.unwrap_or(false)
    }

    fn bump(&self) {
        self.version.send_modify(|v| *v += 1);
    }
}

impl Default for State {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Probe;
    use std::collections::HashSet;
    use std::sync::Arc;

    fn service(name: &str, address: &str) -> Service {
        let mut svc = Service::new(name, 80);
        svc.address = Some(address.parse().unwrap());
        svc
    }

    fn destination(name: &str, service: &str, port: u16) -> Destination {
        Destination::new(name, service, "10.0.0.1".parse().unwrap(), port)
    }

    #[test]
    fn test_get_destinations_filters_by_service() {
        let state = State::new();
        state.add_service(service("a", "192.168.0.1"));
        state.add_service(service("b", "192.168.0.2"));
        state.add_destination(destination("d2", "a", 8081));
        state.add_destination(destination("d1", "a", 8080));
        state.add_destination(destination("d3", "b", 8080));

        let names: HashSet<String> = state
            .get_destinations("a")
            .into_iter()
            .map(|d| d.name)
            .collect();
        assert_eq!(names, HashSet::from(["d1".to_string(), "d2".to_string()]));

        state.delete_destination("d1");
        assert_eq!(state.get_destinations("a").len(), 1);
    }

    #[test]
    fn test_delete_service_cascades() {
        let state = State::new();
        state.add_service(service("a", "192.168.0.1"));
        state.add_destination(destination("d1", "a", 8080));
        state.add_check(CheckSpec::new("a", Probe::Tcp));

        assert!(state.delete_service("a").is_some());
        assert!(state.get_destination("d1").is_none());
        assert!(state.get_checks().is_empty());
        assert!(state.delete_service("a").is_none());
    }

    #[test]
    fn test_snapshot_is_detached() {
        let state = State::new();
        state.add_service(service("a", "192.168.0.1"));
        let snapshot = state.snapshot();

        state.delete_service("a");
        assert_eq!(snapshot.services.len(), 1);
        assert_eq!(snapshot.vips().count(), 1);
        assert!(state.snapshot().services.is_empty());
    }

    #[test]
    fn test_add_check_replaces_same_id() {
        let state = State::new();
        state.add_check(CheckSpec::new("a", Probe::Tcp));
        state.add_check(CheckSpec::new("a", Probe::Tcp));
        assert_eq!(state.get_checks().len(), 1);
        assert!(state.delete_check("a-tcp").is_some());
        assert!(state.delete_check("a-tcp").is_none());
    }

    #[test]
    fn test_version_bumps_on_mutation() {
        let state = State::new();
        let before = state.version();
        state.add_service(service("a", "192.168.0.1"));
        assert!(state.version() > before);

        // Missing entities leave the version untouched.
        let current = state.version();
        state.delete_destination("missing");
        assert_eq!(state.version(), current);
    }

    #[tokio::test]
    async fn test_wait_until_sees_async_update() {
        let state = Arc::new(State::new());
        let writer = Arc::clone(&state);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            writer.add_service(service("late", "192.168.0.9"));
        });

        let seen = state
            .wait_until(Duration::from_secs(2), |s| s.get_service("late").is_some())
            .await;
        assert!(seen);

        let never = state
            .wait_until(Duration::from_millis(20), |s| s.get_service("nope").is_some())
            .await;
        assert!(!never);
    }
}
