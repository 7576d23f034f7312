//! The reconcile pass and the periodic metrics collection.

use crate::balancer::{Addressing, Balancer};
use crate::model::Snapshot;
use crate::sync::{ReconcileError, Syncer};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{Instrument, debug, debug_span, error, info};

/// Run a reconcile pass every time one is requested. Requests that arrive
/// during a pass coalesce into a single follow-up pass.
pub(super) async fn run(balancer: Arc<Balancer>) {
    let mut shutdown = balancer.shutdown.subscribe();
    loop {
        tokio::select! {
            _ = balancer.trigger.notified() => {
                let _ = balancer.reconcile().await;
            }

            _ = shutdown.recv() => break,
        }
    }
    info!("reconcile loop stopped");
}

/// Refresh the state gauges on a fixed period.
pub(super) async fn run_metrics(balancer: Arc<Balancer>) {
    let mut shutdown = balancer.shutdown.subscribe();
    let mut ticker = interval(balancer.settings.metrics_interval.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => balancer.collect_metrics(),
            _ = shutdown.recv() => break,
        }
    }
}

/// Run one synchronizer, tagging a failure with its module name.
async fn stage<S>(syncer: &S, state: &Snapshot) -> Result<(), ReconcileError>
where
    S: Syncer + ?Sized,
{
    let span = debug_span!("sync", module = syncer.name());
    syncer.sync(state).instrument(span).await.map_err(|source| ReconcileError {
        module: syncer.name(),
        source,
    })
}

impl Balancer {
    /// Converge every external system to the traffic-eligible view of the
    /// State Model.
    ///
    /// Synchronizers run in a fixed order: kernel table, firewall, then
    /// routes (anycast) or interface VIPs (unicast, leader only). The first
    /// failure aborts the pass; the next trigger retries it from scratch.
    pub async fn reconcile(&self) -> Result<(), ReconcileError> {
        let _guard = self.reconcile_lock.lock().await;
        let state = self.health.filter_healthy(&self.state.snapshot());

        let result = self.converge(&state).await;
        self.metrics.record_reconcile(result.is_ok());
        match &result {
            Ok(()) => debug!(
                services = state.services.len(),
                destinations = state.destinations.len(),
                "reconciled"
            ),
            Err(e) => {
                self.metrics.record_sync_error(e.module);
                error!(module = e.module, error = %e.source, "reconcile pass failed");
            }
        }
        result
    }

    async fn converge(&self, state: &Snapshot) -> Result<(), ReconcileError> {
        stage(self.kernel.as_ref(), state).await?;
        stage(self.firewall.as_ref(), state).await?;
        match &self.addressing {
            Addressing::Anycast(routes) => stage(routes.as_ref(), state).await,
            Addressing::Unicast(iface) if self.is_leader() => stage(iface.as_ref(), state).await,
            Addressing::Unicast(_) => Ok(()),
        }
    }

    fn collect_metrics(&self) {
        let snapshot = self.state.snapshot();
        let healthy = self.health.filter_healthy(&snapshot).destinations.len();
        self.metrics.set_state_size(
            snapshot.services.len(),
            snapshot.destinations.len(),
            healthy,
        );
        self.metrics.set_leader(self.is_leader());
    }
}
