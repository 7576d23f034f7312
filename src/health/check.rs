//! A running check: one check spec probing one destination.

use crate::health::probe::probe;
use crate::health::{CheckKey, CheckStatus, HealthState};
use crate::metrics::MetricsCollector;
use crate::model::Probe;
use crate::util::ShutdownSignal;
use parking_lot::Mutex;
use rand::Rng;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval, sleep};
use tracing::{Instrument, debug, info, info_span, warn};

/// Emitted when a check's status changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusChange {
    pub key: CheckKey,
    pub status: CheckStatus,
}

/// Everything a running check reports to.
#[derive(Clone)]
pub(crate) struct CheckContext {
    pub state: Arc<HealthState>,
    pub changes: mpsc::UnboundedSender<StatusChange>,
    pub metrics: MetricsCollector,
}

/// A supervised probe loop.
pub struct Check {
    key: CheckKey,
    target: SocketAddr,
    probe: Probe,
    interval: Duration,
    timeout: Duration,
    stop: ShutdownSignal,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Check {
    pub fn new(
        key: CheckKey,
        target: SocketAddr,
        probe: Probe,
        interval: Duration,
        timeout: Duration,
    ) -> Self {
        Self {
            key,
            target,
            probe,
            interval,
            timeout,
            stop: ShutdownSignal::new(),
            handle: Mutex::new(None),
        }
    }

    pub fn key(&self) -> &CheckKey {
        &self.key
    }

    pub fn is_running(&self) -> bool {
        self.handle.lock().is_some()
    }

    /// Spawn the probe loop. Starting a running check does nothing.
    pub(crate) fn start(&self, ctx: CheckContext) {
        let mut handle = self.handle.lock();
        if handle.is_some() {
            return;
        }

        ctx.state.register(self.key.clone());
        let task = ProbeLoop {
            key: self.key.clone(),
            target: self.target,
            probe: self.probe.clone(),
            interval: self.interval,
            timeout: probe_timeout(self.timeout, self.interval),
            ctx,
        };
        let span = info_span!("check", key = %self.key, target = %self.target);
        *handle = Some(tokio::spawn(task.run(self.stop.subscribe()).instrument(span)));
    }

    /// Stop the probe loop, cancelling any probe in flight. Idempotent.
    pub fn stop(&self) {
        if let Some(handle) = self.handle.lock().take() {
            self.stop.shutdown();
            // A probe mid-flight must not report into a restarted check
            // registered under the same key.
            handle.abort();
            debug!(key = %self.key, "check stopped");
        }
    }
}

impl Drop for Check {
    fn drop(&mut self) {
        self.stop();
    }
}

/// A probe may never outlast the interval it runs in.
fn probe_timeout(timeout: Duration, interval: Duration) -> Duration {
    timeout.min(interval)
}

/// Random delay before the first probe, so checks created together spread out.
fn initial_delay(interval: Duration) -> Duration {
    let max = interval.as_millis() as u64;
    if max == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..max))
}

struct ProbeLoop {
    key: CheckKey,
    target: SocketAddr,
    probe: Probe,
    interval: Duration,
    timeout: Duration,
    ctx: CheckContext,
}

impl ProbeLoop {
    async fn run(self, mut stop: broadcast::Receiver<()>) {
        tokio::select! {
            _ = sleep(initial_delay(self.interval)) => {}
            _ = stop.recv() => return,
        }

        // interval() rejects a zero period.
        let mut ticker = interval(self.interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let result = probe(self.target, &self.probe, self.timeout).await;
                    if let Err(reason) = &result {
                        debug!(error = %reason, "probe failed");
                    }
                    observe(&self.ctx, &self.key, result.is_ok());
                }

                _ = stop.recv() => break,
            }
        }
    }
}

/// Record one probe result. A notification is sent only when the status
/// changes.
pub(crate) fn observe(ctx: &CheckContext, key: &CheckKey, ok: bool) -> Option<CheckStatus> {
    ctx.metrics
        .record_health_check(&key.service, &key.destination, ok);

    let status = if ok { CheckStatus::Ok } else { CheckStatus::Bad };
    if !ctx.state.set(key, status) {
        return None;
    }

    ctx.metrics
        .set_destination_health(&key.service, &key.destination, ok);
    if ok {
        info!(key = %key, "check passing");
    } else {
        warn!(key = %key, "check failing");
    }
    let _ = ctx.changes.send(StatusChange {
        key: key.clone(),
        status,
    });
    Some(status)
}
