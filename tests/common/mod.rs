#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::Service;
use kube::ResourceExt;
use unito_operator::api::{self, MySQL, MySQLSpec, Student, StudentSpec};
use unito_operator_controller::{MemoryStore, Registry, Store};
use unito_operator_core::{OperatorConfig, Request};

pub const NAMESPACE: &str = "default";
pub const CLUSTER_IP: &str = "10.96.0.42";

pub fn config() -> Arc<OperatorConfig> {
    Arc::new(
        OperatorConfig::default()
            .resync_interval(Duration::from_secs(300))
            .recheck_interval(Duration::from_secs(10)),
    )
}

pub fn registry() -> Arc<Registry> {
    Arc::new(api::registry())
}

pub fn mysql(name: &str, version: &str, credential: Option<&str>) -> MySQL {
    let mut db = MySQL::new(
        name,
        MySQLSpec {
            version: version.to_string(),
            root_credential: credential.map(str::to_string),
        },
    );
    db.metadata.namespace = Some(NAMESPACE.to_string());
    db
}

pub fn student(name: &str, nickname: Option<&str>) -> Student {
    let mut student = Student::new(
        name,
        StudentSpec {
            surname: "Rossi".to_string(),
            birth_date: "2001-04-12".to_string(),
            nickname: nickname.map(str::to_string),
            ..Default::default()
        },
    );
    student.metadata.namespace = Some(NAMESPACE.to_string());
    student
}

pub fn request(name: &str) -> Request {
    Request::new(NAMESPACE, name)
}

/// Name the reconcilers give the children of `owner`.
pub fn child(prefix: &str, owner: &impl ResourceExt) -> String {
    format!(
        "{}-{}-{}",
        prefix,
        owner.uid().unwrap_or_default(),
        owner.name_any()
    )
}

/// Plays the API server allocating an address for a service.
pub fn assign_cluster_ip(store: &MemoryStore, name: &str) {
    store
        .modify::<Service, _>(NAMESPACE, name, |svc| {
            svc.spec.get_or_insert_with(Default::default).cluster_ip = Some(CLUSTER_IP.to_string());
        })
        .unwrap();
}

pub async fn fetch<K: unito_operator_controller::Object>(store: &MemoryStore, name: &str) -> K {
    store.get::<K>(NAMESPACE, name).await.unwrap().unwrap()
}
