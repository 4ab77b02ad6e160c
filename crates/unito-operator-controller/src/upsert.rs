use kube::ResourceExt;
use tracing::debug;

use unito_operator_core::{ObjectKey, OperationResult, ReconcileError, StoreError};

use crate::store::{Object, Store};

/// Idempotent upsert of the object `namespace/name`.
///
/// `mutate` is the only place desired fields are assigned. It runs against a
/// fresh default object when nothing exists yet, or against the fetched copy
/// otherwise; an update is issued only when the mutated copy differs from
/// what was fetched, and is guarded by the fetched resource version. Store
/// errors are returned untouched (converted into the reconcile taxonomy).
pub async fn create_or_update<S, K, F>(
    store: &S,
    namespace: &str,
    name: &str,
    mut mutate: F,
) -> Result<(K, OperationResult), ReconcileError>
where
    S: Store + ?Sized,
    K: Object + Default,
    F: FnMut(&mut K) -> Result<(), ReconcileError> + Send,
{
    let key = ObjectKey::of::<K>(namespace, name);

    let Some(existing) = store.get::<K>(namespace, name).await? else {
        let mut object = K::default();
        object.meta_mut().name = Some(name.to_string());
        object.meta_mut().namespace = Some(namespace.to_string());
        mutate(&mut object)?;
        ensure_identity(&key, &object)?;

        let created = store.create(&object).await?;
        debug!(%key, "created");
        return Ok((created, OperationResult::Created));
    };

    let mut object = existing.clone();
    mutate(&mut object)?;
    ensure_identity(&key, &object)?;

    let before = serde_json::to_value(&existing).map_err(StoreError::from)?;
    let after = serde_json::to_value(&object).map_err(StoreError::from)?;
    if before == after {
        return Ok((existing, OperationResult::Unchanged));
    }

    let updated = store.replace(&object).await?;
    debug!(%key, "updated");
    Ok((updated, OperationResult::Updated))
}

fn ensure_identity<K: Object>(key: &ObjectKey, object: &K) -> Result<(), ReconcileError> {
    let same_namespace = object.namespace().as_deref() == Some(key.namespace.as_str());
    if object.name_any() != key.name || !same_namespace {
        return Err(ReconcileError::Validation(format!(
            "mutate step changed the identity of {}",
            key
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use k8s_openapi::api::core::v1::ConfigMap;
    use std::collections::BTreeMap;

    fn set_data(
        value: &'static str,
    ) -> impl FnMut(&mut ConfigMap) -> Result<(), ReconcileError> {
        move |cm: &mut ConfigMap| {
            cm.data = Some(BTreeMap::from([("key".to_string(), value.to_string())]));
            Ok(())
        }
    }

    #[tokio::test]
    async fn creates_then_reports_unchanged() {
        let store = MemoryStore::new();

        let (created, result) = create_or_update(&store, "default", "cfg", set_data("a"))
            .await
            .unwrap();
        assert_eq!(result, OperationResult::Created);

        let (again, result) = create_or_update(&store, "default", "cfg", set_data("a"))
            .await
            .unwrap();
        assert_eq!(result, OperationResult::Unchanged);
        assert_eq!(again.resource_version(), created.resource_version());
    }

    #[tokio::test]
    async fn updates_only_on_difference() {
        let store = MemoryStore::new();
        create_or_update(&store, "default", "cfg", set_data("a"))
            .await
            .unwrap();

        let (updated, result) = create_or_update(&store, "default", "cfg", set_data("b"))
            .await
            .unwrap();
        assert_eq!(result, OperationResult::Updated);
        assert_eq!(
            updated.data.unwrap().get("key").map(String::as_str),
            Some("b")
        );
    }

    #[tokio::test]
    async fn mutate_errors_abort_without_writing() {
        let store = MemoryStore::new();
        let err = create_or_update::<_, ConfigMap, _>(&store, "default", "cfg", |_| {
            Err(ReconcileError::Validation("nope".into()))
        })
        .await
        .unwrap_err();

        assert!(matches!(err, ReconcileError::Validation(_)));
        assert_eq!(store.count::<ConfigMap>(), 0);
    }

    #[tokio::test]
    async fn renaming_inside_mutate_is_refused() {
        let store = MemoryStore::new();
        let err = create_or_update::<_, ConfigMap, _>(&store, "default", "cfg", |cm| {
            cm.metadata.name = Some("other".to_string());
            Ok(())
        })
        .await
        .unwrap_err();

        assert!(matches!(err, ReconcileError::Validation(_)));
    }
}
