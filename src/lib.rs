pub mod api;
pub mod context;
pub mod controllers;
pub mod credentials;
pub mod error;
pub mod labels;
pub mod operator;
pub mod provisioning;
pub mod telemetry;

pub use context::Context;
pub use error::{Error, Result};
pub use operator::Operator;
pub use telemetry::init_tracing;

pub mod prelude {
    pub use crate::api::{
        Acceptance, MySQL, MySQLSpec, MySQLStatus, Student, StudentSpec, StudentStatus,
    };
    pub use crate::context::Context;
    pub use crate::controllers::{MySQLReconciler, StudentReconciler};
    pub use crate::error::{Error, Result};
    pub use crate::operator::Operator;
    pub use crate::provisioning::{IdentityRegistry, NoopIdentityRegistry};

    pub use unito_operator_controller::{KubeStore, LocalRunner, MemoryStore, Registry, Store};
    pub use unito_operator_core::{
        Action, CancellationToken, OperatorConfig, ReconcileError, Reconciler, Request,
    };

    pub use std::sync::Arc;
    pub use std::time::Duration;
}
