//! The replicated coordination store and leader election capabilities.
//!
//! The balancer only talks to these traits. `MemoryStore` and
//! `MemoryElection` keep everything in process, which is what a single
//! node and the tests run with.

mod election;
mod memory;

pub use election::{ElectionKey, MemoryElection};
pub use memory::MemoryStore;

use crate::model::{CheckSpec, Destination, Service};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};

/// Failures of the coordination store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("key '{0}' already exists")]
    KeyExists(String),

    #[error("key '{0}' not found")]
    KeyNotFound(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Persistence and change notification for the desired state.
///
/// Subscriptions deliver the full replacement collection after every
/// change. A lagging subscriber should re-read the collection with the
/// matching getter.
#[async_trait]
pub trait Store: Send + Sync {
    async fn get_services(&self) -> Result<Vec<Service>, StoreError>;
    async fn get_destinations(&self) -> Result<Vec<Destination>, StoreError>;
    async fn get_checks(&self) -> Result<Vec<CheckSpec>, StoreError>;

    fn subscribe_services(&self) -> broadcast::Receiver<Vec<Service>>;
    fn subscribe_destinations(&self) -> broadcast::Receiver<Vec<Destination>>;
    fn subscribe_checks(&self) -> broadcast::Receiver<Vec<CheckSpec>>;

    async fn add_service(&self, svc: &Service) -> Result<(), StoreError>;
    async fn delete_service(&self, name: &str) -> Result<(), StoreError>;
    async fn add_destination(&self, dst: &Destination) -> Result<(), StoreError>;
    async fn delete_destination(&self, name: &str) -> Result<(), StoreError>;
    /// Upsert keyed by the spec id.
    async fn add_check(&self, spec: &CheckSpec) -> Result<(), StoreError>;
    async fn delete_check(&self, id: &str) -> Result<(), StoreError>;

    /// Leader election handle for `node_id`, backed by this store.
    fn election(&self, node_id: &str) -> Arc<dyn LeaderElection>;
}

/// Campaign-based leader election.
#[async_trait]
pub trait LeaderElection: Send + Sync {
    /// Start campaigning. The receiver yields `true` when this node is
    /// elected and `false` when it is not (or no longer) the leader.
    /// Only transitions are sent.
    async fn run_for_election(&self) -> Result<mpsc::Receiver<bool>, StoreError>;

    /// Non-blocking read of the current status.
    fn is_leader(&self) -> bool;

    /// Stop campaigning and release leadership if held.
    async fn resign(&self) -> Result<(), StoreError>;
}
