//! Structural checks applied before anything is persisted.

use crate::error::{Result, ValidationErrors};
use crate::model::{CheckSpec, Destination, Probe, Service};

/// Longest accepted entity name.
const MAX_NAME_LEN: usize = 128;

/// Largest persistence timeout accepted by the kernel table (seconds).
const MAX_PERSISTENT: u32 = 31 * 24 * 3600;

/// Largest destination weight accepted by the kernel table.
const MAX_WEIGHT: u32 = 65535;

/// Validate a service before allocation.
pub fn validate_service(svc: &Service) -> Result<()> {
    let mut errors = ValidationErrors::new();

    check_name(&mut errors, "name", &svc.name);
    if svc.port == 0 {
        errors.add("port", "must be between 1 and 65535");
    }
    if svc.persistent > MAX_PERSISTENT {
        errors.add(
            "persistent",
            format!("must not exceed {} seconds", MAX_PERSISTENT),
        );
    }

    errors.into_result()
}

/// Validate a destination before it is bound to a service.
pub fn validate_destination(dst: &Destination) -> Result<()> {
    let mut errors = ValidationErrors::new();

    check_name(&mut errors, "name", &dst.name);
    if dst.port == 0 {
        errors.add("port", "must be between 1 and 65535");
    }
    if dst.address.is_unspecified() {
        errors.add("address", "must be a concrete address");
    }
    if dst.weight > MAX_WEIGHT {
        errors.add("weight", format!("must not exceed {}", MAX_WEIGHT));
    }

    errors.into_result()
}

/// Validate a check spec.
pub fn validate_check(spec: &CheckSpec) -> Result<()> {
    let mut errors = ValidationErrors::new();

    check_name(&mut errors, "service_id", &spec.service_id);
    match &spec.probe {
        Probe::Tcp => {}
        Probe::Http {
            path,
            expected_status,
        } => {
            if !path.starts_with('/') {
                errors.add("path", "must start with '/'");
            }
            if !(100..=599).contains(expected_status) {
                errors.add("expected_status", "must be a valid HTTP status");
            }
        }
        Probe::Script { command, .. } => {
            if command.trim().is_empty() {
                errors.add("command", "cannot be empty");
            }
        }
    }

    errors.into_result()
}

fn check_name(errors: &mut ValidationErrors, field: &str, name: &str) {
    if name.is_empty() {
        errors.add(field, "cannot be empty");
    } else if name.len() > MAX_NAME_LEN {
        errors.add(field, format!("must be at most {} characters", MAX_NAME_LEN));
    } else if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        errors.add(field, "may only contain letters, digits, '-', '_' and '.'");
    }
}
