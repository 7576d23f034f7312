//! Desired-state model: entity types, validation and the concurrent State Model.

mod state;
mod types;
mod validation;

pub use state::{Snapshot, State};
pub use types::*;
pub use validation::{validate_check, validate_destination, validate_service};
