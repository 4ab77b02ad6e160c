//! Identity registration for students, an out-of-process collaborator.

use async_trait::async_trait;
use kube::ResourceExt;
use thiserror::Error;
use tracing::info;

#[cfg(test)]
use mockall::automock;

use crate::api::Student;

#[derive(Error, Debug)]
pub enum ProvisioningError {
    #[error("identity service unavailable: {0}")]
    Unavailable(String),

    #[error("identity rejected: {0}")]
    Rejected(String),
}

/// Identity of a record, the only input cleanup may depend on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordIdentity {
    pub namespace: String,
    pub name: String,
    pub uid: String,
}

impl RecordIdentity {
    pub fn of(student: &Student) -> Self {
        Self {
            namespace: student.namespace().unwrap_or_default(),
            name: student.name_any(),
            uid: student.uid().unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StudentIdentity {
    pub record: RecordIdentity,
    pub nickname: String,
    pub surname: String,
    pub birth_date: String,
    pub course_year: String,
}

impl StudentIdentity {
    pub fn new(student: &Student, nickname: &str) -> Self {
        Self {
            record: RecordIdentity::of(student),
            nickname: nickname.to_string(),
            surname: student.spec.surname.clone(),
            birth_date: student.spec.birth_date.clone(),
            course_year: student.spec.course_year.clone(),
        }
    }
}

/// External identity registry. Both calls must be idempotent: a pass that
/// crashes after `register` but before its finalizer is persisted calls it
/// again, and cleanup is retried until the finalizer is gone.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait IdentityRegistry: Send + Sync {
    async fn register(&self, identity: &StudentIdentity) -> Result<(), ProvisioningError>;

    async fn unregister(&self, identity: &RecordIdentity) -> Result<(), ProvisioningError>;
}

/// Registry that only logs. Used when no identity service is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopIdentityRegistry;

#[async_trait]
impl IdentityRegistry for NoopIdentityRegistry {
    async fn register(&self, identity: &StudentIdentity) -> Result<(), ProvisioningError> {
        info!(
            namespace = %identity.record.namespace,
            name = %identity.record.name,
            nickname = %identity.nickname,
            "registering student identity"
        );
        Ok(())
    }

    async fn unregister(&self, identity: &RecordIdentity) -> Result<(), ProvisioningError> {
        info!(
            namespace = %identity.namespace,
            name = %identity.name,
            "unregistering student identity"
        );
        Ok(())
    }
}
