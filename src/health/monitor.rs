//! Health monitor.
//!
//! Keeps the set of running checks equal to the cross join of check specs
//! and the destinations of their service, and derives the traffic-eligible
//! view of a snapshot.

use crate::health::check::{Check, CheckContext};
use crate::health::{CheckKey, HealthState, StatusChange};
use crate::metrics::MetricsCollector;
use crate::model::{CheckSpec, Snapshot};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// What a running check was started from. A change restarts the check.
#[derive(Debug, Clone, PartialEq, Eq)]
struct CheckPlan {
    spec: CheckSpec,
    target: SocketAddr,
}

struct Running {
    check: Check,
    plan: CheckPlan,
}

pub struct HealthMonitor {
    state: Arc<HealthState>,
    running: Mutex<HashMap<CheckKey, Running>>,
    changes: mpsc::UnboundedSender<StatusChange>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<StatusChange>>>,
    metrics: MetricsCollector,
    default_interval: Duration,
    default_timeout: Duration,
}

impl HealthMonitor {
    pub fn new(metrics: MetricsCollector, default_interval: Duration, default_timeout: Duration) -> Self {
        let (changes, receiver) = mpsc::unbounded_channel();
        Self {
            state: Arc::new(HealthState::new()),
            running: Mutex::new(HashMap::new()),
            changes,
            receiver: Mutex::new(Some(receiver)),
            metrics,
            default_interval,
            default_timeout,
        }
    }

    /// Status changes of every running check. Can be taken once.
    pub fn take_changes(&self) -> Option<mpsc::UnboundedReceiver<StatusChange>> {
        self.receiver.lock().take()
    }

    pub fn health_state(&self) -> &Arc<HealthState> {
        &self.state
    }

    /// Keys of the running checks, sorted.
    pub fn running(&self) -> Vec<CheckKey> {
        let mut keys: Vec<CheckKey> = self.running.lock().keys().cloned().collect();
        keys.sort();
        keys
    }

    fn desired(&self, state: &Snapshot) -> HashMap<CheckKey, CheckPlan> {
        let mut desired = HashMap::new();
        for spec in &state.checks {
            let mut spec = spec.clone();
            spec.apply_defaults(self.default_interval, self.default_timeout);
            for dst in state.destinations_for(&spec.service_id) {
                let key = CheckKey {
                    service: spec.service_id.clone(),
                    destination: dst.name.clone(),
                    check: spec.id.clone(),
                };
                desired.insert(
                    key,
                    CheckPlan {
                        spec: spec.clone(),
                        target: dst.socket_addr(),
                    },
                );
            }
        }
        desired
    }

    /// Converge the running checks to the specs and destinations of `state`.
    pub fn update(&self, state: &Snapshot) {
        let desired = self.desired(state);
        let mut running = self.running.lock();

        let to_remove: Vec<CheckKey> = running
            .iter()
            .filter(|(key, r)| desired.get(*key) != Some(&r.plan))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &to_remove {
            if let Some(r) = running.remove(key) {
                r.check.stop();
                self.state.remove(key);
                self.metrics
                    .clear_destination_health(&key.service, &key.destination);
                debug!(key = %key, "removed check");
            }
        }

        let ctx = CheckContext {
            state: Arc::clone(&self.state),
            changes: self.changes.clone(),
            metrics: self.metrics.clone(),
        };
        let mut started = 0;
        for (key, plan) in desired {
            if running.contains_key(&key) {
                continue;
            }
            let check = Check::new(
                key.clone(),
                plan.target,
                plan.spec.probe.clone(),
                plan.spec.interval,
                plan.spec.timeout,
            );
            check.start(ctx.clone());
            running.insert(key, Running { check, plan });
            started += 1;
        }

        if started > 0 || !to_remove.is_empty() {
            info!(
                started,
                stopped = to_remove.len(),
                running = running.len(),
                "health checks updated"
            );
        }
    }

    /// `state` without the destinations that are failing a check.
    ///
    /// Unknown status counts as healthy, so a destination is never held
    /// back while its first probe is pending.
    pub fn filter_healthy(&self, state: &Snapshot) -> Snapshot {
        let failing = self.state.failing_destinations();
        if failing.is_empty() {
            return state.clone();
        }
        Snapshot {
            services: state.services.clone(),
            destinations: state
                .destinations
                .iter()
                .filter(|d| !failing.contains(&d.name))
                .cloned()
                .collect(),
            checks: state.checks.clone(),
        }
    }

    /// Stop every running check.
    pub fn stop_all(&self) {
        let mut running = self.running.lock();
        for (key, r) in running.drain() {
            r.check.stop();
            self.state.remove(&key);
        }
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        self.stop_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::CheckStatus;
    use crate::model::{Destination, Probe, Service};

    fn monitor() -> HealthMonitor {
        HealthMonitor::new(
            MetricsCollector::new(),
            Duration::from_secs(10),
            Duration::from_secs(5),
        )
    }

    fn snapshot() -> Snapshot {
        let mut web = Service::new("web", 80);
        web.address = Some("192.168.0.1".parse().unwrap());
        Snapshot {
            services: vec![web, Service::new("db", 5432)],
            destinations: vec![
                Destination::new("web-1", "web", "10.0.0.1".parse().unwrap(), 8080),
                Destination::new("web-2", "web", "10.0.0.2".parse().unwrap(), 8080),
                Destination::new("db-1", "db", "10.0.1.1".parse().unwrap(), 5432),
            ],
            checks: vec![CheckSpec::new("web", Probe::Tcp)],
        }
    }

    fn key(destination: &str) -> CheckKey {
        CheckKey {
            service: "web".to_string(),
            destination: destination.to_string(),
            check: "web-tcp".to_string(),
        }
    }

    #[tokio::test]
    async fn test_checks_follow_specs_and_destinations() {
        let monitor = monitor();
        let mut state = snapshot();

        monitor.update(&state);
        assert_eq!(monitor.running(), vec![key("web-1"), key("web-2")]);

        state.destinations.retain(|d| d.name != "web-2");
        monitor.update(&state);
        assert_eq!(monitor.running(), vec![key("web-1")]);

        state.checks.clear();
        monitor.update(&state);
        assert!(monitor.running().is_empty());
    }

    #[tokio::test]
    async fn test_changed_spec_restarts_check() {
        let monitor = monitor();
        let mut state = snapshot();
        monitor.update(&state);
        monitor.health_state().set(&key("web-1"), CheckStatus::Bad);

        state.checks[0].interval = Duration::from_secs(1);
        monitor.update(&state);
        assert_eq!(monitor.running().len(), 2);
        assert_eq!(monitor.health_state().status(&key("web-1")), CheckStatus::Unknown);
    }

    #[tokio::test]
    async fn test_filter_healthy_drops_bad_only() {
        let monitor = monitor();
        let state = snapshot();
        monitor.update(&state);

        monitor.health_state().set(&key("web-1"), CheckStatus::Bad);
        monitor.health_state().set(&key("web-2"), CheckStatus::Ok);

        let filtered = monitor.filter_healthy(&state);
        let names: Vec<&str> = filtered.destinations.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["web-2", "db-1"]);
        assert_eq!(filtered.services, state.services);
    }

    #[tokio::test]
    async fn test_stop_all() {
        let monitor = monitor();
        monitor.update(&snapshot());
        monitor.stop_all();
        assert!(monitor.running().is_empty());
        assert!(monitor.health_state().is_empty());
    }
}
