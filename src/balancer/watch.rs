//! Store and health change observation.

use crate::balancer::Balancer;
use crate::model::{CheckSpec, Destination, Service};
use crate::store::Store;
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, info, warn};

/// Subscriptions to the store's three collections.
pub(super) struct StoreEvents {
    services: broadcast::Receiver<Vec<Service>>,
    destinations: broadcast::Receiver<Vec<Destination>>,
    checks: broadcast::Receiver<Vec<CheckSpec>>,
}

impl StoreEvents {
    pub fn subscribe(store: &dyn Store) -> Self {
        Self {
            services: store.subscribe_services(),
            destinations: store.subscribe_destinations(),
            checks: store.subscribe_checks(),
        }
    }
}

/// Which collection an event refers to.
#[derive(Debug, Clone, Copy)]
enum Collection {
    Services,
    Destinations,
    Checks,
}

/// Apply every replacement collection to the State Model, then refresh
/// the running checks and request a reconcile pass.
pub(super) async fn run(balancer: Arc<Balancer>, mut events: StoreEvents) {
    let mut shutdown = balancer.shutdown.subscribe();
    debug!("store watch starting");

    loop {
        tokio::select! {
            event = events.services.recv() => match event {
                Ok(services) => balancer.state.replace_services(services),
                Err(RecvError::Lagged(skipped)) => {
                    balancer.reload(Collection::Services, skipped).await;
                }
                Err(RecvError::Closed) => break,
            },

            event = events.destinations.recv() => match event {
                Ok(destinations) => balancer.state.replace_destinations(destinations),
                Err(RecvError::Lagged(skipped)) => {
                    balancer.reload(Collection::Destinations, skipped).await;
                }
                Err(RecvError::Closed) => break,
            },

            event = events.checks.recv() => match event {
                Ok(checks) => balancer.state.replace_checks(checks),
                Err(RecvError::Lagged(skipped)) => {
                    balancer.reload(Collection::Checks, skipped).await;
                }
                Err(RecvError::Closed) => break,
            },

            _ = shutdown.recv() => break,
        }

        balancer.health.update(&balancer.state.snapshot());
        balancer.trigger.notify_one();
    }

    info!("store watch stopped");
}

/// Request a reconcile pass whenever a check changes status.
pub(super) async fn run_health(balancer: Arc<Balancer>) {
    let Some(mut changes) = balancer.health.take_changes() else {
        warn!("health changes already taken");
        return;
    };
    let mut shutdown = balancer.shutdown.subscribe();

    loop {
        tokio::select! {
            change = changes.recv() => match change {
                Some(change) => {
                    debug!(key = %change.key, status = %change.status, "health status changed");
                    balancer.trigger.notify_one();
                }
                None => break,
            },

            _ = shutdown.recv() => break,
        }
    }
}

impl Balancer {
    /// Re-read a collection after missing some of its events.
    async fn reload(&self, collection: Collection, skipped: u64) {
        warn!(?collection, skipped, "store events lagged, reloading");
        let result = match collection {
            Collection::Services => self
                .store
                .get_services()
                .await
                .map(|services| self.state.replace_services(services)),
            Collection::Destinations => self
                .store
                .get_destinations()
                .await
                .map(|destinations| self.state.replace_destinations(destinations)),
            Collection::Checks => self
                .store
                .get_checks()
                .await
                .map(|checks| self.state.replace_checks(checks)),
        };
        if let Err(e) = result {
            warn!(?collection, error = %e, "reload failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::balancer::tests::{harness, settle};
    use crate::model::{CheckSpec, Destination, Probe, Service};
    use crate::store::Store;
    use std::net::Ipv4Addr;

    #[tokio::test]
    async fn test_store_changes_reach_state_and_health() {
        let h = harness().await;

        // Writes straight to the store, as another node would.
        let mut svc = Service::new("api", 443);
        svc.address = Some(Ipv4Addr::new(192, 168, 0, 9));
        h.store.add_service(&svc).await.unwrap();
        let dst = Destination::new("api-1", "api", Ipv4Addr::new(10, 0, 2, 1), 8443);
        h.store.add_destination(&dst).await.unwrap();
        let mut spec = CheckSpec::new("api", Probe::Tcp);
        spec.interval = std::time::Duration::from_secs(60);
        h.store.add_check(&spec).await.unwrap();

        settle(&h.balancer, |s| {
            s.get_service("api").is_some()
                && s.get_destination("api-1").is_some()
                && s.get_checks().len() == 1
        })
        .await;

        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(2);
        while h.balancer.health().running().is_empty() {
            assert!(tokio::time::Instant::now() < deadline, "check never started");
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(h.balancer.health().running()[0].destination, "api-1");
        h.balancer.shutdown().await;
    }
}
