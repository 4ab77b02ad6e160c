mod mysql;
mod student;

pub use mysql::*;
pub use student::*;

use k8s_openapi::api::core::v1::Service;

/// Address allocated to a service, once there is a usable one.
pub(crate) fn cluster_ip(svc: &Service) -> Option<String> {
    svc.spec
        .as_ref()?
        .cluster_ip
        .as_deref()
        .filter(|ip| !ip.is_empty() && *ip != "None")
        .map(str::to_string)
}
