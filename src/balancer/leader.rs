//! Leadership gate.
//!
//! In unicast mode only the leader holds the VIPs. Winning an election
//! binds and announces every VIP right away; losing one flushes them.
//! Anycast nodes announce routes regardless of leadership.

use crate::balancer::{Addressing, Balancer};
use crate::sync::{Syncer, VipOwner};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

pub(super) async fn run(balancer: Arc<Balancer>, mut elections: mpsc::Receiver<bool>) {
    let mut shutdown = balancer.shutdown.subscribe();
    loop {
        tokio::select! {
            elected = elections.recv() => match elected {
                Some(elected) => balancer.on_leadership(elected).await,
                None => {
                    warn!("election stream closed");
                    break;
                }
            },

            _ = shutdown.recv() => break,
        }
    }
}

impl Balancer {
    async fn on_leadership(&self, elected: bool) {
        self.leader.store(elected, Ordering::Release);
        self.metrics.set_leader(elected);
        info!(elected, "leadership changed");

        let Addressing::Unicast(iface) = &self.addressing else {
            debug!("anycast mode, vips stay announced");
            return;
        };

        let _guard = self.reconcile_lock.lock().await;
        if elected {
            let state = self.state.snapshot();
            if let Err(e) = iface.sync(&state).await {
                self.metrics.record_sync_error(iface.name());
                error!(module = iface.name(), error = %e, "failed to bind vips");
                return;
            }
            if let Err(e) = iface.announce_all(&state).await {
                warn!(module = iface.name(), error = %e, "gratuitous arp failed");
            }
            // Follow up with a full pass once the lock is released.
            self.trigger.notify_one();
        } else {
            match iface.flush().await {
                Ok(removed) => info!(removed, "released vips after losing leadership"),
                Err(e) => {
                    self.metrics.record_sync_error(iface.name());
                    error!(module = iface.name(), error = %e, "failed to release vips");
                }
            }
        }
    }
}
