//! Health checking.
//!
//! Every check spec is applied to each destination of its service. The
//! monitor keeps those checks running and filters failing destinations out
//! of the view handed to the traffic-bearing synchronizers.

mod check;
mod monitor;
mod probe;
mod state;

pub use check::{Check, StatusChange};
pub use monitor::HealthMonitor;
pub use probe::probe;
pub use state::{CheckKey, CheckStatus, HealthState};
