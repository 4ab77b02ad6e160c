use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use kube::{Resource, ResourceExt};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::{OperatorError, ReconcileError};

/// What the scheduling layer should do once a pass returns successfully.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Re-run the pass after the given delay even if nothing changes.
    RequeueAfter(Duration),
    /// Wait for the next change notification or periodic resync.
    AwaitChange,
}

impl Action {
    pub fn requeue_after(duration: Duration) -> Self {
        Action::RequeueAfter(duration)
    }

    pub fn await_change() -> Self {
        Action::AwaitChange
    }
}

/// Outcome of a single create-or-update call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationResult {
    /// No operation was attempted for this object during the pass.
    #[default]
    None,
    Created,
    Updated,
    Unchanged,
}

impl fmt::Display for OperationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OperationResult::None => "none",
            OperationResult::Created => "created",
            OperationResult::Updated => "updated",
            OperationResult::Unchanged => "unchanged",
        };
        f.write_str(s)
    }
}

/// Identity of a namespaced object in the store: kind, namespace and name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectKey {
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(
        kind: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            kind: kind.into(),
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn of<K>(namespace: &str, name: &str) -> Self
    where
        K: Resource<DynamicType = ()>,
    {
        Self::new(K::kind(&()), namespace, name)
    }

    pub fn from_object<K>(object: &K) -> Self
    where
        K: Resource<DynamicType = ()>,
    {
        Self::new(
            K::kind(&()),
            object.namespace().unwrap_or_default(),
            object.name_any(),
        )
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}/{}", self.kind, self.namespace, self.name)
    }
}

/// A reconciliation request: the namespace and name of the record to converge.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Request {
    pub namespace: String,
    pub name: String,
}

impl Request {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn from_object<K: Resource>(object: &K) -> Self {
        Self::new(object.namespace().unwrap_or_default(), object.name_any())
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// One reconciler per managed kind. A pass always starts from a fresh fetch of
/// the record named by the request and must stop at the next store call once
/// `cancel` fires.
#[async_trait]
pub trait Reconciler: Send + Sync + 'static {
    /// The kind this reconciler owns.
    type Resource: Resource<DynamicType = ()> + Send + Sync + 'static;

    async fn reconcile(
        &self,
        request: &Request,
        cancel: &CancellationToken,
    ) -> Result<Action, ReconcileError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperatorConfig {
    /// Restrict the watch to one namespace; `None` watches all namespaces.
    pub namespace: Option<String>,
    pub field_manager: String,
    pub resync_interval: Duration,
    pub recheck_interval: Duration,
    pub error_requeue: Duration,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            namespace: None,
            field_manager: "unito-operator".to_string(),
            resync_interval: Duration::from_secs(300),
            recheck_interval: Duration::from_secs(10),
            error_requeue: Duration::from_secs(60),
        }
    }
}

impl OperatorConfig {
    pub fn from_env() -> crate::Result<Self> {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("WATCH_NAMESPACE") {
            if !val.is_empty() {
                config.namespace = Some(val);
            }
        }

        if let Ok(val) = std::env::var("FIELD_MANAGER") {
            config.field_manager = val;
        }

        if let Ok(val) = std::env::var("RESYNC_INTERVAL_SECS") {
            config.resync_interval = parse_secs("RESYNC_INTERVAL_SECS", &val)?;
        }

        if let Ok(val) = std::env::var("RECHECK_INTERVAL_SECS") {
            config.recheck_interval = parse_secs("RECHECK_INTERVAL_SECS", &val)?;
        }

        if let Ok(val) = std::env::var("ERROR_REQUEUE_SECS") {
            config.error_requeue = parse_secs("ERROR_REQUEUE_SECS", &val)?;
        }

        Ok(config)
    }

    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn field_manager(mut self, manager: impl Into<String>) -> Self {
        self.field_manager = manager.into();
        self
    }

    pub fn resync_interval(mut self, interval: Duration) -> Self {
        self.resync_interval = interval;
        self
    }

    pub fn recheck_interval(mut self, interval: Duration) -> Self {
        self.recheck_interval = interval;
        self
    }

    pub fn error_requeue(mut self, interval: Duration) -> Self {
        self.error_requeue = interval;
        self
    }
}

fn parse_secs(var: &str, value: &str) -> crate::Result<Duration> {
    let secs: u64 = value
        .parse()
        .map_err(|_| OperatorError::Config(format!("Invalid {}: {:?}", var, value)))?;
    if secs == 0 {
        return Err(OperatorError::Config(format!("{} must be positive", var)));
    }
    Ok(Duration::from_secs(secs))
}
