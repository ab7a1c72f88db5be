//! Error types for the declarative reconciliation engine

use std::fmt;

use thiserror::Error;

/// Result type alias using the engine's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Result type alias for object store calls
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Errors reported by an object store implementation
#[derive(Error, Debug)]
pub enum StoreError {
    /// Object does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Store rejected the write (stale version token, immutable field, already exists)
    #[error("conflict ({reason}): {message}")]
    Conflict { reason: String, message: String },

    /// Store does not serve this type
    #[error("type unknown to the store: {0}")]
    TypeUnknown(String),

    /// Object is malformed for the store (missing name, namespace, type)
    #[error("invalid object: {0}")]
    Invalid(String),

    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Any other backend failure
    #[error("store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Whether the error means the object is not there
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }

    /// Whether the error means the store has no such type
    pub fn is_type_unknown(&self) -> bool {
        matches!(self, StoreError::TypeUnknown(_))
    }

    /// Whether the error is a write conflict
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }
}

/// Engine error types
#[derive(Error, Debug)]
pub enum Error {
    /// Desired object construction failed
    #[error("builder #{index} of component '{component}' failed: {source}")]
    Builder {
        component: String,
        index: usize,
        #[source]
        source: Box<Error>,
    },

    /// Object is already owned by a different component
    #[error("{key} is managed by component '{existing}', refusing to claim it for '{requested}'")]
    TaggingConflict {
        key: String,
        existing: String,
        requested: String,
    },

    /// Store call failed for a specific object
    #[error("failed to {operation} {key}: {source}")]
    Store {
        operation: &'static str,
        key: String,
        #[source]
        source: StoreError,
    },

    /// Update rejected because a field is immutable and recreation is not allowed
    #[error("cannot update {key}: {message}")]
    ImmutableField { key: String, message: String },

    /// Orphan deletion failed
    #[error("failed to purge {key}: {source}")]
    Purge {
        key: String,
        #[source]
        source: StoreError,
    },

    /// Readiness conditions did not hold before the backoff budget ran out
    #[error("timed out waiting for {key} in phase '{phase}' after {attempts} attempts: {last}")]
    ReadinessTimeout {
        phase: String,
        key: String,
        attempts: u32,
        last: String,
    },

    /// Validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Hook failure raised by a policy
    #[error("Policy error: {0}")]
    Policy(String),

    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Aggregated per-object errors of one reconciliation pass
    #[error("{0}")]
    Multiple(Errors),

    /// Finalizer error
    #[error("Finalizer error: {0}")]
    Finalizer(#[source] Box<kube::runtime::finalizer::Error<Error>>),
}

impl Error {
    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    /// Create a policy error
    pub fn policy(msg: impl Into<String>) -> Self {
        Error::Policy(msg.into())
    }

    /// Wrap a store error with the operation and object it was raised for
    pub fn store(operation: &'static str, key: impl fmt::Display, source: StoreError) -> Self {
        Error::Store {
            operation,
            key: key.to_string(),
            source,
        }
    }

    /// Whether the error is (or only contains) tagging conflicts
    pub fn is_tagging_conflict(&self) -> bool {
        match self {
            Error::TaggingConflict { .. } => true,
            Error::Multiple(errors) => {
                !errors.is_empty() && errors.iter().all(Error::is_tagging_conflict)
            }
            _ => false,
        }
    }
}

/// A list of errors collected across one reconciliation pass
#[derive(Debug, Default)]
pub struct Errors(Vec<Error>);

impl Errors {
    pub fn new(errors: Vec<Error>) -> Self {
        Self(errors)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Error> {
        self.0.iter()
    }

    pub fn into_inner(self) -> Vec<Error> {
        self.0
    }
}

impl fmt::Display for Errors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.as_slice() {
            [] => write!(f, "no errors"),
            [only] => write!(f, "{}", only),
            many => {
                write!(f, "{} errors occurred: ", many.len())?;
                for (i, err) in many.iter().enumerate() {
                    if i > 0 {
                        write!(f, "; ")?;
                    }
                    write!(f, "{}", err)?;
                }
                Ok(())
            }
        }
    }
}
