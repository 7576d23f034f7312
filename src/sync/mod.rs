//! Convergence synchronizers.
//!
//! Every synchronizer reads the actual state of one external system,
//! derives the desired state from a [`Snapshot`], and applies the
//! difference: first every missing item is added, then every extra item is
//! removed. Running a synchronizer twice against the same snapshot performs
//! no mutations the second time.
//!
//! Each synchronizer is generic over a small backend trait. The system
//! backends shell out to the usual Linux tools, the memory backends in
//! [`memory`] record their mutations for tests and for running without
//! privileges.

mod command;
mod firewall;
mod gobgp;
mod interface;
mod iproute;
mod iptables;
mod ipvsadm;
mod kernel;
pub mod memory;
mod routes;

pub use command::CommandRunner;
pub use firewall::{Firewall, FirewallSyncer, SnatRule};
pub use gobgp::Gobgp;
pub use interface::{InterfaceAddrs, InterfaceSyncer, VipOwner};
pub use iproute::IpRoute;
pub use iptables::Iptables;
pub use ipvsadm::Ipvsadm;
pub use kernel::{KernelLb, KernelService, KernelSyncer, RealServer, ServiceKey, VirtualService};
pub use routes::{RouteSpeaker, RouteSyncer};

use crate::model::Snapshot;
use async_trait::async_trait;
use std::collections::HashSet;
use std::hash::Hash;
use std::time::Duration;
use thiserror::Error;

/// Failure talking to an external system.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("{program} exited with {status}: {stderr}")]
    Command {
        program: String,
        status: String,
        stderr: String,
    },

    #[error("{program} timed out after {after:?}")]
    Timeout { program: String, after: Duration },

    #[error("failed to run {program}: {source}")]
    Io {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("unexpected output: {0}")]
    Parse(String),

    #[error("{0}")]
    Rejected(String),
}

/// A reconcile pass aborted at `module`.
#[derive(Debug, Error)]
#[error("{module} sync failed: {source}")]
pub struct ReconcileError {
    pub module: &'static str,
    #[source]
    pub source: SyncError,
}

/// Converges one external system towards a snapshot.
#[async_trait]
pub trait Syncer: Send + Sync {
    /// Short name used in logs, metrics and [`ReconcileError`].
    fn name(&self) -> &'static str;

    async fn sync(&self, state: &Snapshot) -> Result<(), SyncError>;
}

/// Items to add and to remove to turn an actual set into a desired one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plan<T> {
    pub to_add: Vec<T>,
    pub to_remove: Vec<T>,
}

impl<T> Plan<T> {
    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty() && self.to_remove.is_empty()
    }
}

/// Set difference in both directions. Items compare structurally.
pub fn plan<T>(desired: &HashSet<T>, actual: &HashSet<T>) -> Plan<T>
where
    T: Eq + Hash + Clone,
{
    Plan {
        to_add: desired.difference(actual).cloned().collect(),
        to_remove: actual.difference(desired).cloned().collect(),
    }
}
