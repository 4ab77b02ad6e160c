use thiserror::Error;

use unito_operator_core::{OperatorError, ReconcileError};

#[derive(Error, Debug)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(#[from] OperatorError),

    #[error("Reconciliation failed: {0}")]
    Reconcile(#[from] ReconcileError),
}

pub type Result<T> = std::result::Result<T, Error>;
