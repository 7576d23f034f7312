//! Error taxonomy of the operation API.

use crate::store::StoreError;
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Result alias for operation API calls.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors returned synchronously by the balancer's operation API.
#[derive(Debug, Error)]
pub enum Error {
    #[error("{kind} '{name}' not found")]
    NotFound { kind: EntityKind, name: String },

    #[error("{kind} '{name}' conflicts with an existing {kind}")]
    Conflict { kind: EntityKind, name: String },

    #[error("validation failed: {0}")]
    Validation(ValidationErrors),

    #[error("no virtual address available")]
    NoAddressAvailable,

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl Error {
    pub(crate) fn service_not_found(name: &str) -> Self {
        Self::NotFound {
            kind: EntityKind::Service,
            name: name.to_string(),
        }
    }

    pub(crate) fn destination_not_found(name: &str) -> Self {
        Self::NotFound {
            kind: EntityKind::Destination,
            name: name.to_string(),
        }
    }

    pub(crate) fn conflict(kind: EntityKind, name: impl Into<String>) -> Self {
        Self::Conflict {
            kind,
            name: name.into(),
        }
    }

    /// Map a store failure about `name` onto the operation taxonomy.
    pub(crate) fn from_store(err: StoreError, kind: EntityKind, name: &str) -> Self {
        match err {
            StoreError::KeyExists(_) => Self::conflict(kind, name),
            StoreError::KeyNotFound(_) => Self::NotFound {
                kind,
                name: name.to_string(),
            },
            other => Self::Store(other),
        }
    }
}

/// The entity an error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Service,
    Destination,
    Check,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityKind::Service => f.write_str("service"),
            EntityKind::Destination => f.write_str("destination"),
            EntityKind::Check => f.write_str("check"),
        }
    }
}

/// Field to message map describing every failed structural check.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationErrors {
    fields: BTreeMap<String, String>,
}

impl ValidationErrors {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a problem with `field`. The first message per field wins.
    pub fn add(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.fields.entry(field.into()).or_insert_with(|| message.into());
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Message recorded for `field`, if any.
    pub fn get(&self, field: &str) -> Option<&str> {
        self.fields.get(field).map(String::as_str)
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// `Ok(())` when nothing was recorded, `Error::Validation` otherwise.
    pub fn into_result(self) -> Result<()> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(Error::Validation(self))
        }
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (field, message) in &self.fields {
            if !first {
                f.write_str("; ")?;
            }
            write!(f, "{}: {}", field, message)?;
            first = false;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_display_joins_fields() {
        let mut errors = ValidationErrors::new();
        errors.add("port", "must be non-zero");
        errors.add("name", "cannot be empty");
        errors.add("name", "ignored second message");

        assert_eq!(
            errors.to_string(),
            "name: cannot be empty; port: must be non-zero"
        );
        assert_eq!(errors.get("name"), Some("cannot be empty"));
    }

    #[test]
    fn test_empty_validation_is_ok() {
        assert!(ValidationErrors::new().into_result().is_ok());
    }

    #[test]
    fn test_error_messages() {
        let err = Error::service_not_found("web");
        assert_eq!(err.to_string(), "service 'web' not found");

        let err = Error::conflict(EntityKind::Destination, "10.0.0.1:80");
        assert!(err.to_string().contains("conflicts"));
    }

    #[test]
    fn test_store_errors_map_to_taxonomy() {
        let err = Error::from_store(
            StoreError::KeyExists("services/web".to_string()),
            EntityKind::Service,
            "web",
        );
        assert!(matches!(err, Error::Conflict { kind: EntityKind::Service, .. }));

        let err = Error::from_store(
            StoreError::KeyNotFound("checks/web-tcp".to_string()),
            EntityKind::Check,
            "web-tcp",
        );
        assert_eq!(err.to_string(), "check 'web-tcp' not found");

        let err = Error::from_store(
            StoreError::Unavailable("down".to_string()),
            EntityKind::Service,
            "web",
        );
        assert!(matches!(err, Error::Store(_)));
    }
}
