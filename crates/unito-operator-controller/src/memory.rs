//! In-process [`Store`] with the semantics the reconcilers rely on: resource
//! versions, status/spec separation, finalizer-gated deletion and
//! owner-reference garbage collection. Every mutation is published on a
//! broadcast channel keyed by object identity.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use k8s_openapi::chrono::Utc;
use kube::{Resource, ResourceExt};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

use unito_operator_core::{ObjectKey, StoreError};

use crate::store::{namespace_of, Object, Store};

const CHANNEL_CAPACITY: usize = 1024;

/// A change to one object, with the objects that own it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub key: ObjectKey,
    pub owners: Vec<ObjectKey>,
    pub removed: bool,
}

/// Store operations a [`Fault`] can target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOp {
    Get,
    Create,
    Replace,
    ReplaceStatus,
    Delete,
}

/// A one-shot injected failure for the next matching operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fault {
    pub op: StoreOp,
    pub kind: String,
}

impl Fault {
    pub fn on<K: Resource<DynamicType = ()>>(op: StoreOp) -> Self {
        Self {
            op,
            kind: K::kind(&()).to_string(),
        }
    }
}

#[derive(Default)]
struct State {
    objects: BTreeMap<ObjectKey, Value>,
    revision: u64,
    faults: Vec<Fault>,
}

impl State {
    fn next_revision(&mut self) -> String {
        self.revision += 1;
        self.revision.to_string()
    }

    fn take_fault(&mut self, op: StoreOp, kind: &str) -> Result<(), StoreError> {
        if let Some(idx) = self.faults.iter().position(|f| f.op == op && f.kind == kind) {
            let fault = self.faults.remove(idx);
            return Err(StoreError::Internal(format!(
                "injected {:?} failure for {}",
                fault.op, fault.kind
            )));
        }
        Ok(())
    }

    fn uid_exists(&self, uid: &str) -> bool {
        self.objects
            .values()
            .any(|v| meta_of(v).ok().and_then(|m| m.uid).as_deref() == Some(uid))
    }

    /// Removes `key` and cascades to dependents whose owners are all gone.
    fn remove(&mut self, key: &ObjectKey, out: &mut Vec<Notification>) {
        let Some(value) = self.objects.remove(key) else {
            return;
        };
        out.push(notification(key, &value, true));

        let mut orphaned_uids: Vec<String> =
            meta_of(&value).ok().and_then(|m| m.uid).into_iter().collect();

        while let Some(uid) = orphaned_uids.pop() {
            let dependents: Vec<ObjectKey> = self
                .objects
                .iter()
                .filter(|(_, v)| owner_uids(v).iter().any(|u| *u == uid))
                .map(|(k, _)| k.clone())
                .collect();

            for dependent in dependents {
                let owners = self
                    .objects
                    .get(&dependent)
                    .map(owner_uids)
                    .unwrap_or_default();
                if owners.iter().any(|u| self.uid_exists(u)) {
                    continue;
                }

                let revision = self.next_revision();
                let Some(value) = self.objects.get_mut(&dependent) else {
                    continue;
                };
                let Ok(mut meta) = meta_of(value) else {
                    continue;
                };

                if meta.finalizers.as_ref().is_some_and(|f| !f.is_empty()) {
                    if meta.deletion_timestamp.is_none() {
                        meta.deletion_timestamp = Some(Time(Utc::now()));
                        meta.resource_version = Some(revision);
                        set_meta(value, &meta);
                        out.push(notification(&dependent, value, false));
                    }
                    continue;
                }

                debug!(key = %dependent, "garbage collecting orphaned dependent");
                if let Some(removed) = self.objects.remove(&dependent) {
                    out.push(notification(&dependent, &removed, true));
                }
                if let Some(uid) = meta.uid {
                    orphaned_uids.push(uid);
                }
            }
        }
    }
}

/// In-memory resource store. Cheap to share behind an `Arc`.
pub struct MemoryStore {
    state: Mutex<State>,
    events: broadcast::Sender<Notification>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            state: Mutex::new(State::default()),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.events.subscribe()
    }

    /// Fail the next operation matching `fault` with an internal store error.
    pub fn inject_fault(&self, fault: Fault) {
        self.state.lock().faults.push(fault);
    }

    pub fn contains<K: Object>(&self, namespace: &str, name: &str) -> bool {
        self.state
            .lock()
            .objects
            .contains_key(&ObjectKey::of::<K>(namespace, name))
    }

    pub fn count<K: Object>(&self) -> usize {
        let kind = K::kind(&());
        self.state
            .lock()
            .objects
            .keys()
            .filter(|k| k.kind == kind)
            .count()
    }

    /// Edit an object the way an outside actor would (a user, a scheduler,
    /// the API server assigning addresses): spec and status alike, with no
    /// resource version check. Identity and the deletion marker are preserved.
    pub fn modify<K, F>(&self, namespace: &str, name: &str, edit: F) -> Result<K, StoreError>
    where
        K: Object,
        F: FnOnce(&mut K),
    {
        let key = ObjectKey::of::<K>(namespace, name);
        let mut events = Vec::new();
        let result = {
            let mut state = self.state.lock();
            let current = state
                .objects
                .get(&key)
                .cloned()
                .ok_or_else(|| StoreError::NotFound(key.clone()))?;
            let current_meta = meta_of(&current)?;

            let mut object: K = serde_json::from_value(current)?;
            edit(&mut object);

            let mut value = serde_json::to_value(&object)?;
            let mut meta = object.meta().clone();
            preserve_identity(&mut meta, &current_meta);
            meta.resource_version = Some(state.next_revision());
            set_meta(&mut value, &meta);

            state.objects.insert(key.clone(), value.clone());
            events.push(notification(&key, &value, false));
            serde_json::from_value(value)?
        };
        self.publish(events);
        Ok(result)
    }

    fn publish(&self, events: Vec<Notification>) {
        for event in events {
            // No subscribers is fine.
            let _ = self.events.send(event);
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get<K: Object>(&self, namespace: &str, name: &str) -> Result<Option<K>, StoreError> {
        let key = ObjectKey::of::<K>(namespace, name);
        let mut state = self.state.lock();
        state.take_fault(StoreOp::Get, &key.kind)?;
        match state.objects.get(&key) {
            Some(value) => Ok(Some(serde_json::from_value(value.clone())?)),
            None => Ok(None),
        }
    }

    async fn list<K: Object>(&self, namespace: Option<&str>) -> Result<Vec<K>, StoreError> {
        let kind = K::kind(&());
        let state = self.state.lock();
        state
            .objects
            .iter()
            .filter(|(k, _)| k.kind == kind && namespace.map_or(true, |ns| k.namespace == ns))
            .map(|(_, v)| serde_json::from_value(v.clone()).map_err(StoreError::from))
            .collect()
    }

    async fn create<K: Object>(&self, object: &K) -> Result<K, StoreError> {
        namespace_of(object)?;
        let key = ObjectKey::from_object(object);
        let mut value = serde_json::to_value(object)?;
        // Status is a subresource; it cannot be set on create.
        if let Some(map) = value.as_object_mut() {
            map.remove("status");
        }

        let mut events = Vec::new();
        let created = {
            let mut state = self.state.lock();
            state.take_fault(StoreOp::Create, &key.kind)?;
            if state.objects.contains_key(&key) {
                return Err(StoreError::AlreadyExists(key));
            }

            let mut meta = object.meta().clone();
            meta.uid = Some(Uuid::new_v4().to_string());
            meta.resource_version = Some(state.next_revision());
            meta.creation_timestamp = Some(Time(Utc::now()));
            meta.deletion_timestamp = None;
            meta.generation = Some(1);
            set_meta(&mut value, &meta);

            state.objects.insert(key.clone(), value.clone());
            events.push(notification(&key, &value, false));
            serde_json::from_value(value)?
        };
        self.publish(events);
        Ok(created)
    }

    async fn replace<K: Object>(&self, object: &K) -> Result<K, StoreError> {
        namespace_of(object)?;
        let key = ObjectKey::from_object(object);
        let mut value = serde_json::to_value(object)?;

        let mut events = Vec::new();
        let replaced = {
            let mut state = self.state.lock();
            state.take_fault(StoreOp::Replace, &key.kind)?;
            let current = state
                .objects
                .get(&key)
                .cloned()
                .ok_or_else(|| StoreError::NotFound(key.clone()))?;
            let current_meta = meta_of(&current)?;
            check_revision(&key, object.resource_version(), &current_meta)?;

            if let Some(map) = value.as_object_mut() {
                match current.get("status") {
                    Some(status) => {
                        map.insert("status".to_string(), status.clone());
                    }
                    None => {
                        map.remove("status");
                    }
                }
            }

            let mut meta = object.meta().clone();
            preserve_identity(&mut meta, &current_meta);
            let generation = current_meta.generation.unwrap_or(1);
            meta.generation = Some(if current.get("spec") != value.get("spec") {
                generation + 1
            } else {
                generation
            });
            meta.resource_version = Some(state.next_revision());
            set_meta(&mut value, &meta);

            let released = meta.deletion_timestamp.is_some()
                && meta.finalizers.as_ref().map_or(true, |f| f.is_empty());
            if released {
                debug!(%key, "last finalizer removed, deleting");
                state.objects.insert(key.clone(), value.clone());
                state.remove(&key, &mut events);
            } else {
                state.objects.insert(key.clone(), value.clone());
                events.push(notification(&key, &value, false));
            }
            serde_json::from_value(value)?
        };
        self.publish(events);
        Ok(replaced)
    }

    async fn replace_status<K: Object>(&self, object: &K) -> Result<K, StoreError> {
        namespace_of(object)?;
        let key = ObjectKey::from_object(object);
        let incoming = serde_json::to_value(object)?;

        let mut events = Vec::new();
        let updated = {
            let mut state = self.state.lock();
            state.take_fault(StoreOp::ReplaceStatus, &key.kind)?;
            let mut value = state
                .objects
                .get(&key)
                .cloned()
                .ok_or_else(|| StoreError::NotFound(key.clone()))?;
            let mut meta = meta_of(&value)?;
            check_revision(&key, object.resource_version(), &meta)?;

            if let Some(map) = value.as_object_mut() {
                match incoming.get("status") {
                    Some(status) if !status.is_null() => {
                        map.insert("status".to_string(), status.clone());
                    }
                    _ => {
                        map.remove("status");
                    }
                }
            }
            meta.resource_version = Some(state.next_revision());
            set_meta(&mut value, &meta);

            state.objects.insert(key.clone(), value.clone());
            events.push(notification(&key, &value, false));
            serde_json::from_value(value)?
        };
        self.publish(events);
        Ok(updated)
    }

    async fn delete<K: Object>(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        let key = ObjectKey::of::<K>(namespace, name);
        let mut events = Vec::new();
        {
            let mut state = self.state.lock();
            state.take_fault(StoreOp::Delete, &key.kind)?;
            let Some(current) = state.objects.get(&key).cloned() else {
                return Ok(());
            };
            let mut meta = meta_of(&current)?;

            if meta.finalizers.as_ref().is_some_and(|f| !f.is_empty()) {
                if meta.deletion_timestamp.is_none() {
                    debug!(%key, "deletion requested, waiting on finalizers");
                    meta.deletion_timestamp = Some(Time(Utc::now()));
                    meta.resource_version = Some(state.next_revision());
                    let mut value = current;
                    set_meta(&mut value, &meta);
                    state.objects.insert(key.clone(), value.clone());
                    events.push(notification(&key, &value, false));
                }
            } else {
                state.remove(&key, &mut events);
            }
        }
        self.publish(events);
        Ok(())
    }
}

fn meta_of(value: &Value) -> Result<ObjectMeta, StoreError> {
    let meta = value.get("metadata").cloned().unwrap_or(Value::Null);
    if meta.is_null() {
        return Ok(ObjectMeta::default());
    }
    Ok(serde_json::from_value(meta)?)
}

fn set_meta(value: &mut Value, meta: &ObjectMeta) {
    if let (Some(map), Ok(meta)) = (value.as_object_mut(), serde_json::to_value(meta)) {
        map.insert("metadata".to_string(), meta);
    }
}

fn owner_uids(value: &Value) -> Vec<String> {
    meta_of(value)
        .ok()
        .and_then(|m| m.owner_references)
        .unwrap_or_default()
        .into_iter()
        .map(|r| r.uid)
        .collect()
}

fn notification(key: &ObjectKey, value: &Value, removed: bool) -> Notification {
    let owners = meta_of(value)
        .ok()
        .and_then(|m| m.owner_references)
        .unwrap_or_default()
        .into_iter()
        .map(|r| ObjectKey::new(r.kind, key.namespace.clone(), r.name))
        .collect();
    Notification {
        key: key.clone(),
        owners,
        removed,
    }
}

/// Uid, creation time and the deletion marker cannot be changed by writers.
fn preserve_identity(meta: &mut ObjectMeta, current: &ObjectMeta) {
    meta.uid = current.uid.clone();
    meta.creation_timestamp = current.creation_timestamp.clone();
    meta.deletion_timestamp = current.deletion_timestamp.clone();
    meta.generation = current.generation;
}

fn check_revision(
    key: &ObjectKey,
    incoming: Option<String>,
    current: &ObjectMeta,
) -> Result<(), StoreError> {
    match incoming {
        Some(rv) if Some(&rv) != current.resource_version.as_ref() => {
            Err(StoreError::Conflict(key.clone()))
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{ConfigMap, Pod, PodStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;

    fn config_map(name: &str) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn owned_pod(name: &str, owner: &ConfigMap) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                owner_references: Some(vec![OwnerReference {
                    api_version: "v1".to_string(),
                    kind: "ConfigMap".to_string(),
                    name: owner.name_any(),
                    uid: owner.uid().unwrap(),
                    controller: Some(true),
                    block_owner_deletion: Some(true),
                }]),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn create_assigns_identity_and_rejects_duplicates() {
        let store = MemoryStore::new();
        let created = store.create(&config_map("a")).await.unwrap();

        assert!(created.uid().is_some());
        assert_eq!(created.resource_version().as_deref(), Some("1"));

        let err = store.create(&config_map("a")).await.unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn stale_replace_is_a_conflict() {
        let store = MemoryStore::new();
        let created = store.create(&config_map("a")).await.unwrap();

        let mut first = created.clone();
        first.data = Some([("k".to_string(), "v1".to_string())].into());
        store.replace(&first).await.unwrap();

        let mut stale = created;
        stale.data = Some([("k".to_string(), "v2".to_string())].into());
        let err = store.replace(&stale).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn replace_ignores_status_and_replace_status_ignores_spec() {
        let store = MemoryStore::new();
        let pod = store.create(&config_pod("p")).await.unwrap();

        let mut with_status = pod.clone();
        with_status.status = Some(PodStatus {
            phase: Some("Running".to_string()),
            ..Default::default()
        });
        let after_replace = store.replace(&with_status).await.unwrap();
        assert!(after_replace.status.is_none());

        let mut relabeled = after_replace.clone();
        relabeled.labels_mut().insert("x".to_string(), "y".to_string());
        relabeled.status = with_status.status.clone();
        let after_status = store.replace_status(&relabeled).await.unwrap();
        assert!(after_status.labels().get("x").is_none());
        assert_eq!(
            after_status.status.and_then(|s| s.phase).as_deref(),
            Some("Running")
        );
    }

    fn config_pod(name: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn finalizers_block_deletion_until_removed() {
        let store = MemoryStore::new();
        let mut cm = config_map("guarded");
        cm.metadata.finalizers = Some(vec!["example.com/cleanup".to_string()]);
        store.create(&cm).await.unwrap();

        store.delete::<ConfigMap>("default", "guarded").await.unwrap();
        let pending: ConfigMap = store.get("default", "guarded").await.unwrap().unwrap();
        assert!(pending.metadata.deletion_timestamp.is_some());

        let mut released = pending.clone();
        released.finalizers_mut().clear();
        store.replace(&released).await.unwrap();
        assert!(!store.contains::<ConfigMap>("default", "guarded"));
    }

    #[tokio::test]
    async fn deleting_owner_collects_dependents() {
        let store = MemoryStore::new();
        let owner = store.create(&config_map("owner")).await.unwrap();
        store.create(&owned_pod("child-a", &owner)).await.unwrap();
        store.create(&owned_pod("child-b", &owner)).await.unwrap();
        store.create(&config_pod("unrelated")).await.unwrap();

        store.delete::<ConfigMap>("default", "owner").await.unwrap();

        assert_eq!(store.count::<Pod>(), 1);
        assert!(store.contains::<Pod>("default", "unrelated"));
    }

    #[tokio::test]
    async fn notifications_name_owners() {
        let store = MemoryStore::new();
        let mut events = store.subscribe();
        let owner = store.create(&config_map("owner")).await.unwrap();
        store.create(&owned_pod("child", &owner)).await.unwrap();

        let first = events.recv().await.unwrap();
        assert_eq!(first.key, ObjectKey::new("ConfigMap", "default", "owner"));
        let second = events.recv().await.unwrap();
        assert_eq!(
            second.owners,
            vec![ObjectKey::new("ConfigMap", "default", "owner")]
        );
    }

    #[tokio::test]
    async fn injected_faults_fire_once() {
        let store = MemoryStore::new();
        store.inject_fault(Fault::on::<ConfigMap>(StoreOp::Create));

        assert!(store.create(&config_map("a")).await.is_err());
        assert!(store.create(&config_map("a")).await.is_ok());
    }
}
