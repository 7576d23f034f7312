//! Metrics collector using prometheus-client.
//!
//! Tracks the size of the desired state, leadership, reconcile outcomes,
//! health probe results and VIP allocations.

use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;
use std::sync::Arc;

/// Outcome of a reconcile pass, probe or allocation.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum Outcome {
    Success,
    Failure,
}

impl Outcome {
    fn from_ok(ok: bool) -> Self {
        if ok { Outcome::Success } else { Outcome::Failure }
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct OutcomeLabels {
    pub result: Outcome,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ModuleLabels {
    pub module: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct DestinationLabels {
    pub service: String,
    pub destination: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct HealthCheckLabels {
    pub service: String,
    pub destination: String,
    pub result: Outcome,
}

/// Collects and stores all metrics.
#[derive(Clone)]
pub struct MetricsCollector {
    inner: Arc<MetricsCollectorInner>,
}

struct MetricsCollectorInner {
    /// Services in the State Model.
    services: Gauge,
    /// Destinations in the State Model.
    destinations: Gauge,
    /// Destinations not currently failing their checks.
    healthy_destinations: Gauge,
    /// 1 while this node holds leadership.
    leader: Gauge,
    reconcile_passes_total: Family<OutcomeLabels, Counter>,
    sync_errors_total: Family<ModuleLabels, Counter>,
    health_checks_total: Family<HealthCheckLabels, Counter>,
    /// Per destination health (1 = healthy, 0 = unhealthy).
    destination_health: Family<DestinationLabels, Gauge>,
    vip_allocations_total: Family<OutcomeLabels, Counter>,
    /// The prometheus registry.
    registry: Registry,
}

impl MetricsCollector {
    /// Create a new metrics collector.
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let services = Gauge::default();
        let destinations = Gauge::default();
        let healthy_destinations = Gauge::default();
        let leader = Gauge::default();
        let reconcile_passes_total = Family::<OutcomeLabels, Counter>::default();
        let sync_errors_total = Family::<ModuleLabels, Counter>::default();
        let health_checks_total = Family::<HealthCheckLabels, Counter>::default();
        let destination_health = Family::<DestinationLabels, Gauge>::default();
        let vip_allocations_total = Family::<OutcomeLabels, Counter>::default();

        registry.register(
            "l4plane_services",
            "Number of services in the state model",
            services.clone(),
        );
        registry.register(
            "l4plane_destinations",
            "Number of destinations in the state model",
            destinations.clone(),
        );
        registry.register(
            "l4plane_healthy_destinations",
            "Number of destinations eligible for traffic",
            healthy_destinations.clone(),
        );
        registry.register(
            "l4plane_leader",
            "Whether this node is the leader (1) or not (0)",
            leader.clone(),
        );
        registry.register(
            "l4plane_reconcile_passes",
            "Total number of reconcile passes",
            reconcile_passes_total.clone(),
        );
        registry.register(
            "l4plane_sync_errors",
            "Total number of reconcile passes aborted by a synchronizer",
            sync_errors_total.clone(),
        );
        registry.register(
            "l4plane_health_checks",
            "Total number of health probes performed",
            health_checks_total.clone(),
        );
        registry.register(
            "l4plane_destination_health",
            "Destination health status (1=healthy, 0=unhealthy)",
            destination_health.clone(),
        );
        registry.register(
            "l4plane_vip_allocations",
            "Total number of VIP allocation attempts",
            vip_allocations_total.clone(),
        );

        Self {
            inner: Arc::new(MetricsCollectorInner {
                services,
                destinations,
                healthy_destinations,
                leader,
                reconcile_passes_total,
                sync_errors_total,
                health_checks_total,
                destination_health,
                vip_allocations_total,
                registry,
            }),
        }
    }

    /// Get the prometheus registry for encoding.
    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    /// Refresh the state size gauges.
    pub fn set_state_size(&self, services: usize, destinations: usize, healthy: usize) {
        self.inner.services.set(services as i64);
        self.inner.destinations.set(destinations as i64);
        self.inner.healthy_destinations.set(healthy as i64);
    }

    pub fn set_leader(&self, leader: bool) {
        self.inner.leader.set(i64::from(leader));
    }

    /// Role last published through [`set_leader`](Self::set_leader).
    pub fn is_leader(&self) -> bool {
        self.inner.leader.get() == 1
    }

    pub fn record_reconcile(&self, ok: bool) {
        let labels = OutcomeLabels {
            result: Outcome::from_ok(ok),
        };
        self.inner.reconcile_passes_total.get_or_create(&labels).inc();
    }

    pub fn record_sync_error(&self, module: &str) {
        let labels = ModuleLabels {
            module: module.to_string(),
        };
        self.inner.sync_errors_total.get_or_create(&labels).inc();
    }

    /// Record a health probe result.
    pub fn record_health_check(&self, service: &str, destination: &str, success: bool) {
        let labels = HealthCheckLabels {
            service: service.to_string(),
            destination: destination.to_string(),
            result: Outcome::from_ok(success),
        };
        self.inner.health_checks_total.get_or_create(&labels).inc();
    }

    /// Update destination health status.
    pub fn set_destination_health(&self, service: &str, destination: &str, healthy: bool) {
        let labels = DestinationLabels {
            service: service.to_string(),
            destination: destination.to_string(),
        };
        self.inner
            .destination_health
            .get_or_create(&labels)
            .set(if healthy { 1 } else { 0 });
    }

    /// Drop the health series of a destination whose check stopped.
    pub fn clear_destination_health(&self, service: &str, destination: &str) {
        let labels = DestinationLabels {
            service: service.to_string(),
            destination: destination.to_string(),
        };
        self.inner.destination_health.remove(&labels);
    }

    pub fn record_vip_allocation(&self, ok: bool) {
        let labels = OutcomeLabels {
            result: Outcome::from_ok(ok),
        };
        self.inner.vip_allocations_total.get_or_create(&labels).inc();
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus_client::encoding::text::encode;

    fn encoded(collector: &MetricsCollector) -> String {
        let mut buffer = String::new();
        encode(&mut buffer, collector.registry()).unwrap();
        buffer
    }

    #[test]
    fn test_state_gauges() {
        let collector = MetricsCollector::new();
        collector.set_state_size(3, 7, 5);
        collector.set_leader(true);

        let buffer = encoded(&collector);
        assert!(buffer.contains("l4plane_services 3"));
        assert!(buffer.contains("l4plane_destinations 7"));
        assert!(buffer.contains("l4plane_healthy_destinations 5"));
        assert!(buffer.contains("l4plane_leader 1"));
    }

    #[test]
    fn test_sync_errors_by_module() {
        let collector = MetricsCollector::new();
        collector.record_reconcile(false);
        collector.record_sync_error("firewall");
        collector.record_sync_error("firewall");

        let buffer = encoded(&collector);
        assert!(buffer.contains("l4plane_sync_errors_total{module=\"firewall\"} 2"));
        assert!(buffer.contains("l4plane_reconcile_passes_total"));
    }

    #[test]
    fn test_destination_health_cleared() {
        let collector = MetricsCollector::new();
        collector.record_health_check("web", "web-1", true);
        collector.set_destination_health("web", "web-1", false);
        assert!(encoded(&collector).contains("destination=\"web-1\"} 0"));

        collector.clear_destination_health("web", "web-1");
        assert!(!encoded(&collector).contains("l4plane_destination_health{"));
    }

    #[test]
    fn test_vip_allocations() {
        let collector = MetricsCollector::new();
        collector.record_vip_allocation(true);
        collector.record_vip_allocation(false);
        assert!(encoded(&collector).contains("l4plane_vip_allocations_total"));
    }
}
