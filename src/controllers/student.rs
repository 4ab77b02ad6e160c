use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Container, Service, ServicePort};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;
use tracing::{info, instrument, warn};

use unito_operator_controller::{
    add_finalizer, child_name, finalizer_state, remove_finalizer, FinalizerState, Registry, Store,
};
use unito_operator_core::{
    Action, CancellationToken, OperatorConfig, ReconcileError, Reconciler, Request,
};

use crate::api::{Acceptance, Student};
use crate::context::Context;
use crate::controllers::cluster_ip;
use crate::labels::Labels;
use crate::provisioning::{IdentityRegistry, RecordIdentity, StudentIdentity};

/// Finalizer guarding a student until its identity has been unregistered.
pub const STUDENT_FINALIZER: &str = "k8s.unito.it/api";

pub const HTTP_PORT: i32 = 80;

const CHILD_PREFIX: &str = "unito";
const CONTAINER_NAME: &str = "nginx";
const IMAGE: &str = "nginx";

pub struct StudentReconciler<S, I> {
    store: Arc<S>,
    registry: Arc<Registry>,
    config: Arc<OperatorConfig>,
    identities: Arc<I>,
}

impl<S, I> StudentReconciler<S, I>
where
    S: Store + 'static,
    I: IdentityRegistry + 'static,
{
    pub fn new(
        store: Arc<S>,
        registry: Arc<Registry>,
        config: Arc<OperatorConfig>,
        identities: Arc<I>,
    ) -> Self {
        Self {
            store,
            registry,
            config,
            identities,
        }
    }

    async fn converge(&self, ctx: &Context<S>) -> Result<Action, ReconcileError> {
        info!("handling resource");

        let Some(mut student) = ctx.fetch::<Student>().await? else {
            info!("object has been deleted");
            return Ok(ctx.done());
        };

        match finalizer_state(&student, STUDENT_FINALIZER) {
            FinalizerState::Finalizing => return self.finalize(ctx, &mut student).await,
            FinalizerState::Released => {
                info!("deletion requested, nothing left to clean up");
                return Ok(ctx.done());
            }
            FinalizerState::Pending | FinalizerState::Registered => {}
        }

        if let Err(err) = student.spec.validate() {
            warn!(error = %err, "spec is invalid, waiting for it to change");
            return Ok(ctx.done());
        }

        let Some(nickname) = student.spec.nickname().map(str::to_string) else {
            info!("skipping resource, missing nickname");
            return Ok(ctx.recheck());
        };

        if finalizer_state(&student, STUDENT_FINALIZER) == FinalizerState::Pending {
            self.identities
                .register(&StudentIdentity::new(&student, &nickname))
                .await
                .map_err(|e| ReconcileError::Dependency(e.to_string()))?;
            add_finalizer(ctx.store(), &mut student, STUDENT_FINALIZER).await?;
            info!(%nickname, "student registered");
            // The finalizer write triggers the next pass.
            return Ok(ctx.done());
        }

        let child = child_name(CHILD_PREFIX, &student)?;
        let labels = Labels::student(&student.name_any());

        let (deployment, result) = ctx
            .apply_child(&student, &child, |deployment: &mut Deployment| {
                let spec = deployment.spec.get_or_insert_with(Default::default);
                spec.replicas.get_or_insert(1);
                spec.selector = LabelSelector {
                    match_labels: Some(labels.clone().into_inner()),
                    ..Default::default()
                };

                let template = &mut spec.template;
                template
                    .metadata
                    .get_or_insert_with(Default::default)
                    .labels = Some(labels.clone().into_inner());
                let pod = template.spec.get_or_insert_with(Default::default);
                if pod.containers.is_empty() {
                    pod.containers.push(Container::default());
                }
                // Fields the API server would default are pinned so the
                // comparison against the stored copy stays stable.
                let container = &mut pod.containers[0];
                container.name = CONTAINER_NAME.to_string();
                container.image = Some(IMAGE.to_string());
                container.image_pull_policy = Some("Always".to_string());
                container.termination_message_path = Some("/dev/termination-log".to_string());
                container.termination_message_policy = Some("File".to_string());
                Ok(())
            })
            .await?;
        info!(%result, deployment = %child, "deployment reconciliation completed");

        ctx.update_status(&mut student, |status| status.initialized = true)
            .await?;

        let selector = deployment
            .spec
            .as_ref()
            .and_then(|spec| spec.selector.match_labels.clone())
            .unwrap_or_default();

        let (svc, result) = ctx
            .apply_child(&student, &child, |svc: &mut Service| {
                let spec = svc.spec.get_or_insert_with(Default::default);
                spec.type_ = Some("ClusterIP".to_string());
                spec.ports = Some(vec![ServicePort {
                    name: Some("http".to_string()),
                    port: HTTP_PORT,
                    protocol: Some("TCP".to_string()),
                    target_port: Some(IntOrString::Int(HTTP_PORT)),
                    ..Default::default()
                }]);
                spec.selector = Some(selector.clone());
                Ok(())
            })
            .await?;
        info!(%result, service = %child, "service reconciliation completed");

        let Some(address) = cluster_ip(&svc) else {
            info!("waiting for ClusterIP for the student service");
            return Ok(ctx.done());
        };

        ctx.update_status(&mut student, move |status| status.address = address)
            .await?;

        let acceptance = if is_available(&deployment) {
            Acceptance::Accepted
        } else {
            Acceptance::Rejected
        };
        ctx.update_status(&mut student, |status| status.acceptance = acceptance)
            .await?;

        info!(?acceptance, "reconciliation completed");
        Ok(ctx.done())
    }

    /// Releases the external identity, then the finalizer. The finalizer
    /// stays when unregistering fails so cleanup is retried.
    async fn finalize(
        &self,
        ctx: &Context<S>,
        student: &mut Student,
    ) -> Result<Action, ReconcileError> {
        self.identities
            .unregister(&RecordIdentity::of(student))
            .await
            .map_err(|e| ReconcileError::Dependency(e.to_string()))?;
        remove_finalizer(ctx.store(), student, STUDENT_FINALIZER).await?;

        info!("student unregistered, deletion may proceed");
        Ok(ctx.done())
    }
}

#[async_trait]
impl<S, I> Reconciler for StudentReconciler<S, I>
where
    S: Store + 'static,
    I: IdentityRegistry + 'static,
{
    type Resource = Student;

    #[instrument(skip_all, fields(kind = "Student", namespace = %request.namespace, name = %request.name))]
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

fn is_available(deployment: &Deployment) -> bool {
    deployment.status.as_ref().is_some_and(|status| {
        status.unavailable_replicas.unwrap_or(0) == 0 && status.available_replicas.unwrap_or(0) > 0
    })
}
