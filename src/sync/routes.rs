//! Anycast route synchronizer.
//!
//! In anycast mode every node advertises a /32 route for each virtual
//! address and the network spreads traffic across them, so no leadership
//! is involved.

use crate::model::Snapshot;
use crate::sync::{SyncError, Syncer, plan};
use async_trait::async_trait;
use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

/// Access to the routes originated by the local routing daemon.
#[async_trait]
pub trait RouteSpeaker: Send + Sync {
    /// Locally originated /32 routes.
    async fn routes(&self) -> Result<HashSet<Ipv4Addr>, SyncError>;

    async fn announce(&self, address: Ipv4Addr) -> Result<(), SyncError>;
    async fn withdraw(&self, address: Ipv4Addr) -> Result<(), SyncError>;
}

pub struct RouteSyncer<R> {
    speaker: Arc<R>,
    lock: Mutex<()>,
}

impl<R: RouteSpeaker> RouteSyncer<R> {
    pub fn new(speaker: Arc<R>) -> Self {
        Self {
            speaker,
            lock: Mutex::new(()),
        }
    }
}

#[async_trait]
impl<R: RouteSpeaker> Syncer for RouteSyncer<R> {
    fn name(&self) -> &'static str {
        "routes"
    }

    async fn sync(&self, state: &Snapshot) -> Result<(), SyncError> {
        let _guard = self.lock.lock().await;

        let desired: HashSet<Ipv4Addr> = state.vips().collect();
        let actual = self.speaker.routes().await?;
        let plan = plan(&desired, &actual);

        for address in &plan.to_add {
            self.speaker.announce(*address).await?;
            info!(vip = %address, "announced route");
        }
        for address in &plan.to_remove {
            self.speaker.withdraw(*address).await?;
            info!(vip = %address, "withdrew route");
        }
        Ok(())
    }
}
