use std::sync::Arc;

use kube::ResourceExt;
use unito_operator_controller::{
    create_or_update, set_controller_reference, update_status, Cancellable, Object, Registry,
    StatusObject, Store,
};
use unito_operator_core::{
    Action, CancellationToken, OperationResult, OperatorConfig, ReconcileError, Request,
};

/// Everything one reconciliation pass works with. Built fresh per pass so no
/// in-memory state survives from one pass to the next; every store call goes
/// through a cancellable handle.
pub struct Context<S: Store> {
    store: Cancellable<S>,
    registry: Arc<Registry>,
    config: Arc<OperatorConfig>,
    request: Request,
}

impl<S: Store> Context<S> {
    pub fn new(
        store: Arc<S>,
        registry: Arc<Registry>,
        config: Arc<OperatorConfig>,
        request: Request,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store: Cancellable::new(store, cancel),
            registry,
            config,
            request,
        }
    }

    pub fn store(&self) -> &Cancellable<S> {
        &self.store
    }

    pub fn name(&self) -> &str {
        &self.request.name
    }

    pub fn namespace(&self) -> &str {
        &self.request.namespace
    }

    /// Fetches the record this pass is about.
    pub async fn fetch<K: Object>(&self) -> Result<Option<K>, ReconcileError> {
        Ok(self.store.get(self.namespace(), self.name()).await?)
    }

    pub async fn get<K: Object>(&self, name: &str) -> Result<Option<K>, ReconcileError> {
        Ok(self.store.get(self.namespace(), name).await?)
    }

    pub async fn delete<K: Object>(&self, name: &str) -> Result<(), ReconcileError> {
        Ok(self.store.delete::<K>(self.namespace(), name).await?)
    }

    /// Create-or-update of a child of `owner`, with the controller reference
    /// stamped in the same mutate step as the desired fields.
    pub async fn apply_child<P, K, F>(
        &self,
        owner: &P,
        name: &str,
        mut mutate: F,
    ) -> Result<(K, OperationResult), ReconcileError>
    where
        P: Object,
        K: Object + Default,
        F: FnMut(&mut K) -> Result<(), ReconcileError> + Send,
    {
        let namespace = owner.namespace().unwrap_or_default();
        let registry = &self.registry;
        create_or_update(&self.store, &namespace, name, |child: &mut K| {
            mutate(child)?;
            set_controller_reference(registry, owner, child)?;
            Ok(())
        })
        .await
    }

    pub async fn update_status<K, F>(
        &self,
        resource: &mut K,
        mutate: F,
    ) -> Result<bool, ReconcileError>
    where
        K: StatusObject,
        F: FnOnce(&mut K::Status) + Send,
    {
        update_status(&self.store, resource, mutate).await
    }

    /// Ask for a re-check after the configured interval.
    pub fn recheck(&self) -> Action {
        Action::requeue_after(self.config.recheck_interval)
    }

    pub fn done(&self) -> Action {
        Action::await_change()
    }
}
