use thiserror::Error;

use crate::types::ObjectKey;

#[derive(Error, Debug)]
pub enum OperatorError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, OperatorError>;

/// Errors surfaced by a resource store implementation.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(ObjectKey),

    #[error("{0} already exists")]
    AlreadyExists(ObjectKey),

    #[error("{0} was modified concurrently (stale resource version)")]
    Conflict(ObjectKey),

    #[error("{0} has no namespace")]
    MissingNamespace(String),

    #[error("store operation cancelled")]
    Cancelled,

    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Internal(String),
}

/// Failures while stamping an owner reference on a child object.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OwnerError {
    #[error("kind {0} is not registered")]
    UnregisteredKind(String),

    #[error("owner {kind} {name} has no uid yet")]
    MissingUid { kind: String, name: String },

    #[error("{child} is already controlled by {owner_kind} {owner_name}")]
    AlreadyOwned {
        child: String,
        owner_kind: String,
        owner_name: String,
    },

    #[error("cross-namespace owner reference from {child_namespace} to {owner_namespace}")]
    CrossNamespace {
        child_namespace: String,
        owner_namespace: String,
    },
}

/// Error taxonomy of a reconciliation pass.
#[derive(Error, Debug)]
pub enum ReconcileError {
    /// The record or a child vanished mid-pass.
    #[error("{0} not found")]
    NotFound(ObjectKey),

    #[error("write conflict on {0}; a fresh read is required")]
    Conflict(ObjectKey),

    #[error("invalid spec: {0}")]
    Validation(String),

    #[error("external dependency failed: {0}")]
    Dependency(String),

    #[error("store failure: {0}")]
    Store(#[source] StoreError),

    #[error("ownership error: {0}")]
    Ownership(#[from] OwnerError),

    #[error("reconciliation cancelled")]
    Cancelled,
}

impl ReconcileError {
    /// Validation failures wait for a new spec generation; everything else is
    /// worth another pass.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ReconcileError::Validation(_) | ReconcileError::NotFound(_))
    }
}

impl From<StoreError> for ReconcileError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(key) => ReconcileError::NotFound(key),
            StoreError::Conflict(key) | StoreError::AlreadyExists(key) => {
                ReconcileError::Conflict(key)
            }
            StoreError::Cancelled => ReconcileError::Cancelled,
            other => ReconcileError::Store(other),
        }
    }
}
