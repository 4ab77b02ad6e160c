use std::fmt::Debug;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::core::NamespaceResourceScope;
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use unito_operator_core::{ObjectKey, StoreError};

/// Namespaced objects the store can hold.
pub trait Object:
    Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Clone
    + Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
}

impl<T> Object for T where
    T: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static
{
}

/// The declarative object store the reconcilers converge against.
///
/// `replace` and `replace_status` are guarded by the resource version carried
/// in the object's metadata: a stale version fails with
/// [`StoreError::Conflict`] instead of overwriting a concurrent write.
/// `replace` never touches status and `replace_status` never touches anything
/// else. `delete` of an absent object succeeds.
#[async_trait]
pub trait Store: Send + Sync {
    async fn get<K: Object>(&self, namespace: &str, name: &str) -> Result<Option<K>, StoreError>;

    async fn list<K: Object>(&self, namespace: Option<&str>) -> Result<Vec<K>, StoreError>;

    async fn create<K: Object>(&self, object: &K) -> Result<K, StoreError>;

    async fn replace<K: Object>(&self, object: &K) -> Result<K, StoreError>;

    async fn replace_status<K: Object>(&self, object: &K) -> Result<K, StoreError>;

    async fn delete<K: Object>(&self, namespace: &str, name: &str) -> Result<(), StoreError>;
}

#[async_trait]
impl<S: Store + ?Sized> Store for Arc<S> {
    async fn get<K: Object>(&self, namespace: &str, name: &str) -> Result<Option<K>, StoreError> {
        (**self).get(namespace, name).await
    }

    async fn list<K: Object>(&self, namespace: Option<&str>) -> Result<Vec<K>, StoreError> {
        (**self).list(namespace).await
    }

    async fn create<K: Object>(&self, object: &K) -> Result<K, StoreError> {
        (**self).create(object).await
    }

    async fn replace<K: Object>(&self, object: &K) -> Result<K, StoreError> {
        (**self).replace(object).await
    }

    async fn replace_status<K: Object>(&self, object: &K) -> Result<K, StoreError> {
        (**self).replace_status(object).await
    }

    async fn delete<K: Object>(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        (**self).delete::<K>(namespace, name).await
    }
}

pub(crate) fn namespace_of<K: Object>(object: &K) -> Result<String, StoreError> {
    object
        .namespace()
        .ok_or_else(|| StoreError::MissingNamespace(object.name_any()))
}

/// [`Store`] backed by the Kubernetes API server.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
    field_manager: String,
}

impl KubeStore {
    pub fn new(client: Client, field_manager: impl Into<String>) -> Self {
        Self {
            client,
            field_manager: field_manager.into(),
        }
    }

    fn api<K: Object>(&self, namespace: &str) -> Api<K> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn post_params(&self) -> PostParams {
        PostParams {
            field_manager: Some(self.field_manager.clone()),
            ..PostParams::default()
        }
    }
}

fn from_kube(err: kube::Error, key: ObjectKey) -> StoreError {
    match err {
        kube::Error::Api(ae) if ae.code == 404 => StoreError::NotFound(key),
        kube::Error::Api(ae) if ae.code == 409 && ae.reason == "AlreadyExists" => {
            StoreError::AlreadyExists(key)
        }
        kube::Error::Api(ae) if ae.code == 409 => StoreError::Conflict(key),
        other => StoreError::Kube(other),
    }
}

#[async_trait]
impl Store for KubeStore {
    async fn get<K: Object>(&self, namespace: &str, name: &str) -> Result<Option<K>, StoreError> {
        self.api::<K>(namespace)
            .get_opt(name)
            .await
            .map_err(|e| from_kube(e, ObjectKey::of::<K>(namespace, name)))
    }

    async fn list<K: Object>(&self, namespace: Option<&str>) -> Result<Vec<K>, StoreError> {
        let api: Api<K> = match namespace {
            Some(ns) => self.api(ns),
            None => Api::all(self.client.clone()),
        };
        let list = api.list(&ListParams::default()).await?;
        Ok(list.items)
    }

    async fn create<K: Object>(&self, object: &K) -> Result<K, StoreError> {
        let namespace = namespace_of(object)?;
        let key = ObjectKey::from_object(object);
        debug!(%key, "creating object");
        self.api::<K>(&namespace)
            .create(&self.post_params(), object)
            .await
            .map_err(|e| from_kube(e, key))
    }

    async fn replace<K: Object>(&self, object: &K) -> Result<K, StoreError> {
        let namespace = namespace_of(object)?;
        let key = ObjectKey::from_object(object);
        debug!(%key, "replacing object");
        self.api::<K>(&namespace)
            .replace(&object.name_any(), &self.post_params(), object)
            .await
            .map_err(|e| from_kube(e, key))
    }

    async fn replace_status<K: Object>(&self, object: &K) -> Result<K, StoreError> {
        let namespace = namespace_of(object)?;
        let key = ObjectKey::from_object(object);

        let mut body = serde_json::to_value(object)?;
        let status = body.get_mut("status").map(Value::take).unwrap_or(Value::Null);
        // A resourceVersion in the patch body makes the API server reject stale writes.
        let patch = json!({
            "metadata": { "resourceVersion": object.resource_version() },
            "status": status,
        });
        let params = PatchParams {
            field_manager: Some(self.field_manager.clone()),
            ..PatchParams::default()
        };

        debug!(%key, "updating status");
        self.api::<K>(&namespace)
            .patch_status(&object.name_any(), &params, &Patch::Merge(&patch))
            .await
            .map_err(|e| from_kube(e, key))
    }

    async fn delete<K: Object>(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        match self
            .api::<K>(namespace)
            .delete(name, &DeleteParams::background())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(from_kube(e, ObjectKey::of::<K>(namespace, name))),
        }
    }
}

/// Store wrapper that aborts at the next I/O boundary once the token fires.
pub struct Cancellable<S> {
    inner: Arc<S>,
    token: CancellationToken,
}

impl<S> Clone for Cancellable<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            token: self.token.clone(),
        }
    }
}

impl<S: Store> Cancellable<S> {
    pub fn new(inner: Arc<S>, token: CancellationToken) -> Self {
        Self { inner, token }
    }

    async fn guard<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, StoreError>> + Send,
    {
        if self.token.is_cancelled() {
            return Err(StoreError::Cancelled);
        }
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(StoreError::Cancelled),
            result = op => result,
        }
    }
}

#[async_trait]
impl<S: Store> Store for Cancellable<S> {
    async fn get<K: Object>(&self, namespace: &str, name: &str) -> Result<Option<K>, StoreError> {
        self.guard(self.inner.get(namespace, name)).await
    }

    async fn list<K: Object>(&self, namespace: Option<&str>) -> Result<Vec<K>, StoreError> {
        self.guard(self.inner.list(namespace)).await
    }

    async fn create<K: Object>(&self, object: &K) -> Result<K, StoreError> {
        self.guard(self.inner.create(object)).await
    }

    async fn replace<K: Object>(&self, object: &K) -> Result<K, StoreError> {
        self.guard(self.inner.replace(object)).await
    }

    async fn replace_status<K: Object>(&self, object: &K) -> Result<K, StoreError> {
        self.guard(self.inner.replace_status(object)).await
    }

    async fn delete<K: Object>(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        self.guard(self.inner.delete::<K>(namespace, name)).await
    }
}
