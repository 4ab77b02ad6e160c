use kube::ResourceExt;
use tracing::info;

use unito_operator_core::ReconcileError;

use crate::store::{Object, Store};

/// Where a record stands with respect to one finalizer token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalizerState {
    /// Live, token not yet recorded.
    Pending,
    /// Live, token recorded; normal reconciliation proceeds.
    Registered,
    /// Deletion requested and the token still blocks it; run cleanup.
    Finalizing,
    /// Deletion requested and nothing of ours blocks it.
    Released,
}

pub fn finalizer_state<K: Object>(resource: &K, finalizer: &str) -> FinalizerState {
    match (is_being_deleted(resource), has_finalizer(resource, finalizer)) {
        (false, false) => FinalizerState::Pending,
        (false, true) => FinalizerState::Registered,
        (true, true) => FinalizerState::Finalizing,
        (true, false) => FinalizerState::Released,
    }
}

pub fn has_finalizer<K: Object>(resource: &K, finalizer: &str) -> bool {
    resource.finalizers().iter().any(|f| f == finalizer)
}

pub fn is_being_deleted<K: Object>(resource: &K) -> bool {
    resource.meta().deletion_timestamp.is_some()
}

/// Records `finalizer` on `resource` and persists it. `resource` is replaced
/// by the stored copy so later writes in the same pass carry the new
/// resource version. Returns whether a write happened.
pub async fn add_finalizer<S, K>(
    store: &S,
    resource: &mut K,
    finalizer: &str,
) -> Result<bool, ReconcileError>
where
    S: Store + ?Sized,
    K: Object,
{
    if has_finalizer(resource, finalizer) {
        return Ok(false);
    }

    let mut updated = resource.clone();
    updated.finalizers_mut().push(finalizer.to_string());
    *resource = store.replace(&updated).await?;

    info!("Added finalizer {} to {}", finalizer, resource.name_any());
    Ok(true)
}

/// Drops `finalizer` from `resource` and persists it, which lets the store
/// complete a pending deletion once no other finalizer remains.
pub async fn remove_finalizer<S, K>(
    store: &S,
    resource: &mut K,
    finalizer: &str,
) -> Result<bool, ReconcileError>
where
    S: Store + ?Sized,
    K: Object,
{
    if !has_finalizer(resource, finalizer) {
        return Ok(false);
    }

    let mut updated = resource.clone();
    updated.finalizers_mut().retain(|f| f != finalizer);
    *resource = store.replace(&updated).await?;

    info!("Removed finalizer {} from {}", finalizer, resource.name_any());
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use k8s_openapi::api::core::v1::ConfigMap;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    const TOKEN: &str = "example.com/cleanup";

    fn config_map() -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some("guarded".to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn walks_the_state_machine() {
        let store = MemoryStore::new();
        let mut cm = store.create(&config_map()).await.unwrap();
        assert_eq!(finalizer_state(&cm, TOKEN), FinalizerState::Pending);

        assert!(add_finalizer(&store, &mut cm, TOKEN).await.unwrap());
        assert!(!add_finalizer(&store, &mut cm, TOKEN).await.unwrap());
        assert_eq!(finalizer_state(&cm, TOKEN), FinalizerState::Registered);

        store.delete::<ConfigMap>("default", "guarded").await.unwrap();
        let mut cm: ConfigMap = store.get("default", "guarded").await.unwrap().unwrap();
        assert_eq!(finalizer_state(&cm, TOKEN), FinalizerState::Finalizing);

        assert!(remove_finalizer(&store, &mut cm, TOKEN).await.unwrap());
        assert_eq!(finalizer_state(&cm, TOKEN), FinalizerState::Released);
        assert!(!store.contains::<ConfigMap>("default", "guarded"));
    }

    #[tokio::test]
    async fn stale_copy_cannot_add_finalizer() {
        let store = MemoryStore::new();
        let mut stale = store.create(&config_map()).await.unwrap();
        store
            .modify::<ConfigMap, _>("default", "guarded", |cm| {
                cm.labels_mut().insert("edited".to_string(), "yes".to_string());
            })
            .unwrap();

        let err = add_finalizer(&store, &mut stale, TOKEN).await.unwrap_err();
        assert!(matches!(err, ReconcileError::Conflict(_)));
    }
}
