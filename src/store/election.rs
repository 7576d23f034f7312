//! Leader election over a shared in-memory key.

use crate::store::{LeaderElection, StoreError};
use crate::util::ShutdownSignal;
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

/// The contended key: holds the id of the current leader, if any.
#[derive(Debug)]
pub struct ElectionKey {
    holder: watch::Sender<Option<String>>,
}

impl ElectionKey {
    pub fn new() -> Self {
        let (holder, _) = watch::channel(None);
        Self { holder }
    }

    /// Id of the current leader.
    pub fn leader(&self) -> Option<String> {
        self.holder.borrow().clone()
    }

    /// Hand the key to `node` regardless of the current holder, as a
    /// partitioned or preempting peer would.
    pub fn seize(&self, node: &str) {
        self.holder.send_replace(Some(node.to_string()));
    }

    fn try_claim(&self, node: &str) -> bool {
        self.holder.send_if_modified(|holder| {
            if holder.is_none() {
                *holder = Some(node.to_string());
                true
            } else {
                false
            }
        })
    }

    fn release(&self, node: &str) -> bool {
        self.holder.send_if_modified(|holder| {
            if holder.as_deref() == Some(node) {
                *holder = None;
                true
            } else {
                false
            }
        })
    }
}

impl Default for ElectionKey {
    fn default() -> Self {
        Self::new()
    }
}

/// One candidate campaigning for an `ElectionKey`.
pub struct MemoryElection {
    key: Arc<ElectionKey>,
    node: String,
    campaigning: Arc<AtomicBool>,
    stop: ShutdownSignal,
}

impl MemoryElection {
    pub fn new(key: Arc<ElectionKey>, node: impl Into<String>) -> Self {
        Self {
            key,
            node: node.into(),
            campaigning: Arc::new(AtomicBool::new(false)),
            stop: ShutdownSignal::new(),
        }
    }
}

#[async_trait]
impl LeaderElection for MemoryElection {
    async fn run_for_election(&self) -> Result<mpsc::Receiver<bool>, StoreError> {
        let (tx, rx) = mpsc::channel(8);
        let key = Arc::clone(&self.key);
        let node = self.node.clone();
        let campaigning = Arc::clone(&self.campaigning);
        let mut stop = self.stop.subscribe();
        let mut changes = key.holder.subscribe();

        campaigning.store(true, Ordering::Release);
        info!(node = %node, "campaigning for leadership");

        tokio::spawn(async move {
            let mut last = None;
            loop {
                if campaigning.load(Ordering::Acquire) {
                    key.try_claim(&node);
                }
                let elected = changes.borrow_and_update().as_deref() == Some(node.as_str());
                if last != Some(elected) {
                    last = Some(elected);
                    debug!(node = %node, elected, "leadership status changed");
                    if tx.send(elected).await.is_err() {
                        break;
                    }
                }

                tokio::select! {
                    changed = changes.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = stop.recv() => break,
                }
            }
        });

        Ok(rx)
    }

    fn is_leader(&self) -> bool {
        self.key.holder.borrow().as_deref() == Some(self.node.as_str())
    }

    async fn resign(&self) -> Result<(), StoreError> {
        self.campaigning.store(false, Ordering::Release);
        if self.key.release(&self.node) {
            info!(node = %self.node, "resigned leadership");
        }
        self.stop.shutdown();
        Ok(())
    }
}
