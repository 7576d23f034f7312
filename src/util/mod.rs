//! Utility functions and helpers.

pub(crate) mod duration;
mod logging;
mod shutdown;

pub use logging::init_logging;
pub use shutdown::ShutdownSignal;
