use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Pod, Service};
use kube::api::Api;
use kube::runtime::controller::{self, Controller};
use kube::runtime::watcher::Config as WatcherConfig;
use kube::{Client, Resource};
use tracing::{error, info, warn};

use unito_operator_controller::{KubeStore, Object, Registry};
use unito_operator_core::{
    Action, CancellationToken, OperatorConfig, ReconcileError, Reconciler, Request,
};

use crate::api::{self, MySQL, Student};
use crate::controllers::{MySQLReconciler, StudentReconciler};
use crate::error::Result;
use crate::provisioning::{IdentityRegistry, NoopIdentityRegistry};

/// Runs the `MySQL` and `Student` reconcilers against the cluster until a
/// shutdown signal arrives or the token from [`Operator::shutdown_token`] is
/// cancelled.
pub struct Operator<I = NoopIdentityRegistry> {
    config: OperatorConfig,
    identities: Arc<I>,
    shutdown: CancellationToken,
}

impl Operator<NoopIdentityRegistry> {
    pub fn new(config: OperatorConfig) -> Self {
        Self {
            config,
            identities: Arc::new(NoopIdentityRegistry),
            shutdown: CancellationToken::new(),
        }
    }
}

impl<I: IdentityRegistry + 'static> Operator<I> {
    pub fn with_identity_registry<J>(self, identities: J) -> Operator<J>
    where
        J: IdentityRegistry + 'static,
    {
        Operator {
            config: self.config,
            identities: Arc::new(identities),
            shutdown: self.shutdown,
        }
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub async fn run(self) -> Result<()> {
        let client = Client::try_default().await?;
        let namespace = self.config.namespace.clone();

        info!(
            namespace = namespace.as_deref().unwrap_or("*"),
            field_manager = %self.config.field_manager,
            "Starting operator"
        );

        let store = Arc::new(KubeStore::new(
            client.clone(),
            self.config.field_manager.clone(),
        ));
        let registry: Arc<Registry> = Arc::new(api::registry());
        let config = Arc::new(self.config);
        let ns = namespace.as_deref();

        let mysql = Controller::new(scoped::<MySQL>(&client, ns), WatcherConfig::default())
            .owns(scoped::<Pod>(&client, ns), WatcherConfig::default())
            .owns(scoped::<Service>(&client, ns), WatcherConfig::default());
        let student = Controller::new(scoped::<Student>(&client, ns), WatcherConfig::default())
            .owns(scoped::<Deployment>(&client, ns), WatcherConfig::default())
            .owns(scoped::<Service>(&client, ns), WatcherConfig::default());

        let mysql = drive(
            mysql,
            MySQLReconciler::new(Arc::clone(&store), Arc::clone(&registry), Arc::clone(&config)),
            Arc::clone(&config),
            self.shutdown.clone(),
        );
        let student = drive(
            student,
            StudentReconciler::new(store, registry, Arc::clone(&config), self.identities),
            config,
            self.shutdown.clone(),
        );

        tokio::spawn(cancel_on_signal(self.shutdown.clone()));

        tokio::select! {
            _ = futures::future::join(mysql, student) => {
                info!("Controllers stopped");
            }
            _ = self.shutdown.cancelled() => {
                info!("Shutdown requested, stopping controllers");
            }
        }

        Ok(())
    }
}

fn scoped<K: Object>(client: &Client, namespace: Option<&str>) -> Api<K> {
    match namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    }
}

struct Shared<R> {
    reconciler: R,
    config: Arc<OperatorConfig>,
    shutdown: CancellationToken,
}

async fn drive<R>(
    controller: Controller<R::Resource>,
    reconciler: R,
    config: Arc<OperatorConfig>,
    shutdown: CancellationToken,
) where
    R: Reconciler,
    R::Resource: Object,
{
    let kind = R::Resource::kind(&()).to_string();
    info!(%kind, "Starting controller");

    let shared = Arc::new(Shared {
        reconciler,
        config,
        shutdown,
    });

    controller
        .run(reconcile::<R>, error_policy::<R>, shared)
        .for_each(|result| {
            let kind = kind.clone();
            async move {
                match result {
                    Ok((object, action)) => {
                        info!(%kind, name = %object.name, ?action, "Reconciled");
                    }
                    Err(e) => {
                        error!(%kind, error = %e, "Reconciliation error");
                    }
                }
            }
        })
        .await;
}

async fn reconcile<R>(
    object: Arc<R::Resource>,
    shared: Arc<Shared<R>>,
) -> std::result::Result<controller::Action, ReconcileError>
where
    R: Reconciler,
    R::Resource: Object,
{
    let request = Request::from_object(object.as_ref());
    let action = shared
        .reconciler
        .reconcile(&request, &shared.shutdown)
        .await?;

    // Waiting for a change still re-evaluates every record once per resync.
    Ok(match action {
        Action::RequeueAfter(delay) => controller::Action::requeue(delay),
        Action::AwaitChange => controller::Action::requeue(shared.config.resync_interval),
    })
}

fn error_policy<R>(
    object: Arc<R::Resource>,
    error: &ReconcileError,
    shared: Arc<Shared<R>>,
) -> controller::Action
where
    R: Reconciler,
    R::Resource: Object,
{
    let request = Request::from_object(object.as_ref());
    if error.is_retryable() {
        warn!(%request, %error, "Reconciliation failed, retrying");
        controller::Action::requeue(shared.config.error_requeue)
    } else {
        warn!(%request, %error, "Reconciliation parked until the next resync");
        controller::Action::requeue(shared.config.resync_interval)
    }
}

/// Cancels `token` on SIGINT or SIGTERM.
pub async fn cancel_on_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT, initiating graceful shutdown"),
        _ = token.cancelled() => return,
        _ = terminate => info!("Received SIGTERM, initiating graceful shutdown"),
    }

    token.cancel();
}
