//! Health state management.
//!
//! Shared status of every running check, keyed by service, destination
//! and check id.

use dashmap::DashMap;
use std::collections::HashSet;
use std::fmt;

/// Identity of one running check: a check spec applied to one destination.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CheckKey {
    pub service: String,
    pub destination: String,
    /// Id of the check spec.
    pub check: String,
}

impl fmt::Display for CheckKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.service, self.destination, self.check)
    }
}

/// Status of a running check.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum CheckStatus {
    /// No probe has completed yet.
    #[default]
    Unknown,
    Ok,
    Bad,
}

impl fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckStatus::Unknown => f.write_str("unknown"),
            CheckStatus::Ok => f.write_str("ok"),
            CheckStatus::Bad => f.write_str("bad"),
        }
    }
}

/// Shared health state for all running checks.
#[derive(Debug, Default)]
pub struct HealthState {
    checks: DashMap<CheckKey, CheckStatus>,
}

impl HealthState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking `key` as unknown.
    pub fn register(&self, key: CheckKey) {
        self.checks.entry(key).or_default();
    }

    pub fn remove(&self, key: &CheckKey) {
        self.checks.remove(key);
    }

    /// Record `status` for a registered `key`. Returns whether the status
    /// changed. Results for keys no longer tracked are dropped.
    pub fn set(&self, key: &CheckKey, status: CheckStatus) -> bool {
        match self.checks.get_mut(key) {
            Some(mut entry) if *entry != status => {
                *entry = status;
                true
            }
            _ => false,
        }
    }

    pub fn status(&self, key: &CheckKey) -> CheckStatus {
        self.checks
            .get(key)
            .map(|s| *s)
            .unwrap_or_default()
    }

    /// Destinations with at least one failing check.
    pub fn failing_destinations(&self) -> HashSet<String> {
        self.checks
            .iter()
            .filter(|entry| *entry.value() == CheckStatus::Bad)
            .map(|entry| entry.key().destination.clone())
            .collect()
    }

    /// Number of tracked checks.
    pub fn len(&self) -> usize {
        self.checks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.checks.is_empty()
    }
}
