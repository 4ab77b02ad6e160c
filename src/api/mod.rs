//! Custom resources managed by the operator.

mod mysql;
mod student;

pub use mysql::*;
pub use student::*;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Pod, Service};
use unito_operator_controller::Registry;

/// Registry of every kind the reconcilers own or create.
pub fn registry() -> Registry {
    Registry::new()
        .register::<MySQL>()
        .register::<Student>()
        .register::<Pod>()
        .register::<Service>()
        .register::<Deployment>()
}
