//! l4plane - control plane for a distributed Layer 4 load balancer
//!
//! The desired state (services, destinations and health check specs) lives
//! in a replicated store. Every node mirrors it into a local State Model
//! and converges the host towards it:
//! - the kernel IPVS table
//! - SNAT rules for NAT-mode services
//! - VIPs bound to the interface by the leader (unicast) or announced as
//!   host routes by every node (anycast)
//!
//! Destinations failing their health checks are kept out of the kernel
//! table without being removed from the desired state.

pub mod balancer;
pub mod config;
pub mod error;
pub mod health;
pub mod ipam;
pub mod metrics;
pub mod model;
pub mod store;
pub mod sync;
pub mod util;

pub use balancer::{Addressing, Balancer, Components, Settings};
pub use config::Config;
pub use error::{Error, Result};
