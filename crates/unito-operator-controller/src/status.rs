use tracing::debug;

use kube::ResourceExt;
use unito_operator_core::ReconcileError;

use crate::store::{Object, Store};

/// Records whose controller-owned state lives in a status subresource.
pub trait StatusObject: Object {
    type Status: Clone + Default + PartialEq + Send + Sync;

    fn status(&self) -> Option<&Self::Status>;

    fn status_mut(&mut self) -> &mut Option<Self::Status>;
}

/// Applies `mutate` to the record's status and persists it as one committed
/// write, guarded by the record's resource version. Nothing is written when
/// the status is already as desired. On success `resource` holds the stored
/// copy. Returns whether a write happened.
pub async fn update_status<S, K, F>(
    store: &S,
    resource: &mut K,
    mutate: F,
) -> Result<bool, ReconcileError>
where
    S: Store + ?Sized,
    K: StatusObject,
    F: FnOnce(&mut K::Status) + Send,
{
    let current = resource.status().cloned().unwrap_or_default();
    let mut desired = current.clone();
    mutate(&mut desired);

    if resource.status().is_some() && desired == current {
        return Ok(false);
    }

    let mut next = resource.clone();
    *next.status_mut() = Some(desired);
    *resource = store.replace_status(&next).await?;

    debug!("Updated status for {}", resource.name_any());
    Ok(true)
}
