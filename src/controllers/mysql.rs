use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Container, EnvVar, Pod, Service, ServicePort};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;
use tracing::{info, instrument, warn};

use unito_operator_controller::{child_name, is_being_deleted, Registry, Store};
use unito_operator_core::{
    Action, CancellationToken, OperationResult, OperatorConfig, ReconcileError, Reconciler,
    Request,
};

use crate::api::MySQL;
use crate::context::Context;
use crate::controllers::cluster_ip;
use crate::credentials::{self, CredentialSource, CREDENTIAL_ENV};
use crate::labels::Labels;

pub const MYSQL_PORT: i32 = 3306;

const CHILD_PREFIX: &str = "mysql";
const CONTAINER_NAME: &str = "db";
const IMAGE_REPOSITORY: &str = "docker.io/mysql";

/// Converges a `MySQL` record into an instance pod plus a service in front of
/// it, and publishes initialization, address, credential and readiness.
pub struct MySQLReconciler<S> {
    store: Arc<S>,
    registry: Arc<Registry>,
    config: Arc<OperatorConfig>,
}

impl<S: Store + 'static> MySQLReconciler<S> {
    pub fn new(store: Arc<S>, registry: Arc<Registry>, config: Arc<OperatorConfig>) -> Self {
        Self {
            store,
            registry,
            config,
        }
    }

    async fn converge(&self, ctx: &Context<S>) -> Result<Action, ReconcileError> {
        info!("handling resource");

        let Some(mut db) = ctx.fetch::<MySQL>().await? else {
            info!("object has been deleted");
            return Ok(ctx.done());
        };

        if is_being_deleted(&db) {
            // Pod and service are owned by the record and collected with it.
            info!("deletion requested, nothing to clean up");
            return Ok(ctx.done());
        }

        if let Err(err) = db.spec.validate() {
            warn!(error = %err, "spec is invalid, waiting for it to change");
            return Ok(ctx.done());
        }

        let child = child_name(CHILD_PREFIX, &db)?;

        let Some((pod, credential, result)) = self.reconcile_pod(ctx, &db, &child).await? else {
            info!(pod = %child, "instance pod is terminating, waiting for it to go away");
            return Ok(ctx.recheck());
        };
        info!(%result, pod = %child, "pod reconciliation completed");

        ctx.update_status(&mut db, |status| status.initialized = true)
            .await?;

        let (svc, result) = self.reconcile_service(ctx, &db, &child, &pod).await?;
        info!(%result, service = %child, "service reconciliation completed");

        let Some(address) = cluster_ip(&svc) else {
            info!("waiting for ClusterIP for the MySQL instance");
            return Ok(ctx.done());
        };

        ctx.update_status(&mut db, move |status| status.address = address)
            .await?;
        ctx.update_status(&mut db, move |status| status.credential = credential)
            .await?;

        let ready = is_running(&pod);
        ctx.update_status(&mut db, |status| status.ready = ready)
            .await?;

        info!(ready, "reconciliation completed");
        Ok(ctx.done())
    }

    /// Upserts the instance pod and returns the credential it now runs with.
    /// Yields nothing while a previous pod of the same name is terminating.
    async fn reconcile_pod(
        &self,
        ctx: &Context<S>,
        db: &MySQL,
        name: &str,
    ) -> Result<Option<(Pod, String, OperationResult)>, ReconcileError> {
        let running: Option<Pod> = ctx.get(name).await?;
        if running.as_ref().is_some_and(is_terminating) {
            return Ok(None);
        }
        let recorded = db.status.as_ref().map(|s| s.credential.as_str());
        let source = CredentialSource::decide(
            db.spec.declared_credential(),
            recorded,
            running.as_ref().and_then(credentials::carried_by),
        );

        if source.replaces_child() {
            // Process identity is not mutable in place: destroy and recreate.
            info!(pod = %name, "root credential changed, recreating the instance pod");
            ctx.delete::<Pod>(name).await?;
            if ctx.get::<Pod>(name).await?.is_some_and(|pod| is_terminating(&pod)) {
                return Ok(None);
            }
        }

        let minted = match source {
            CredentialSource::Generate => credentials::generate(),
            _ => String::new(),
        };
        let image = format!("{}:{}", IMAGE_REPOSITORY, db.spec.version);
        let labels = Labels::mysql(&db.name_any());
        let mut applied = String::new();

        let (pod, result) = ctx
            .apply_child(db, name, |pod: &mut Pod| {
                labels.merge_into(pod.labels_mut());

                let spec = pod.spec.get_or_insert_with(Default::default);
                if spec.containers.is_empty() {
                    spec.containers.push(Container::default());
                }
                let container = &mut spec.containers[0];
                container.name = CONTAINER_NAME.to_string();
                container.image = Some(image.clone());

                let env = container.env.get_or_insert_with(Vec::new);
                let carried = env
                    .iter()
                    .find(|var| var.name == CREDENTIAL_ENV)
                    .and_then(|var| var.value.as_deref());
                let credential = source.resolve(carried, &minted);
                match env.iter_mut().find(|var| var.name == CREDENTIAL_ENV) {
                    Some(var) => var.value = Some(credential.clone()),
                    None => env.push(EnvVar {
                        name: CREDENTIAL_ENV.to_string(),
                        value: Some(credential.clone()),
                        ..Default::default()
                    }),
                }

                applied = credential;
                Ok(())
            })
            .await?;

        Ok(Some((pod, applied, result)))
    }

    async fn reconcile_service(
        &self,
        ctx: &Context<S>,
        db: &MySQL,
        name: &str,
        pod: &Pod,
    ) -> Result<(Service, OperationResult), ReconcileError> {
        let selector = Labels::mysql(&db.name_any()).select_from(pod.labels());

        ctx.apply_child(db, name, |svc: &mut Service| {
            let spec = svc.spec.get_or_insert_with(Default::default);
            spec.ports = Some(vec![ServicePort {
                name: Some("mysql".to_string()),
                protocol: Some("TCP".to_string()),
                port: MYSQL_PORT,
                target_port: Some(IntOrString::Int(MYSQL_PORT)),
                ..Default::default()
            }]);
            spec.selector = Some(selector.clone());
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl<S: Store + 'static> Reconciler for MySQLReconciler<S> {
    type Resource = MySQL;

    #[instrument(skip_all, fields(kind = "MySQL", namespace = %request.namespace, name = %request.name))]
    async fn reconcile(
        &self,
        request: &Request,
        cancel: &CancellationToken,
    ) -> Result<Action, ReconcileError> {
        let ctx = Context::new(
            Arc::clone(&self.store),
            Arc::clone(&self.registry),
            Arc::clone(&self.config),
            request.clone(),
            cancel.clone(),
        );

        match self.converge(&ctx).await {
            Err(ReconcileError::NotFound(key)) => {
                info!(%key, "object disappeared during the pass");
                Ok(ctx.done())
            }
            other => other,
        }
    }
}

fn is_running(pod: &Pod) -> bool {
    pod.status.as_ref().and_then(|s| s.phase.as_deref()) == Some("Running")
}

fn is_terminating(pod: &Pod) -> bool {
    pod.metadata.deletion_timestamp.is_some()
}
