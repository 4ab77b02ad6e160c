use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use kube::Resource;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use unito_operator_core::{Action, Reconciler, Request};

use crate::memory::{MemoryStore, Notification};
use crate::store::{Object, Store};

/// Drives one reconciler from a [`MemoryStore`]'s notifications.
///
/// A record is queued when it changes, when an object it owns changes, and on
/// every resync tick, so each record is re-evaluated at least once per
/// `resync_interval` with or without events. Passes run one at a time, so the
/// same record is never reconciled concurrently.
pub struct LocalRunner<R> {
    store: Arc<MemoryStore>,
    reconciler: Arc<R>,
    resync_interval: Duration,
    error_requeue: Duration,
}

impl<R> LocalRunner<R>
where
    R: Reconciler,
    R::Resource: Object,
{
    pub fn new(store: Arc<MemoryStore>, reconciler: Arc<R>) -> Self {
        Self {
            store,
            reconciler,
            resync_interval: Duration::from_secs(300),
            error_requeue: Duration::from_secs(60),
        }
    }

    pub fn resync_interval(mut self, interval: Duration) -> Self {
        self.resync_interval = interval;
        self
    }

    pub fn error_requeue(mut self, interval: Duration) -> Self {
        self.error_requeue = interval;
        self
    }

    pub async fn run(self, shutdown: CancellationToken) {
        let kind = R::Resource::kind(&()).to_string();
        let mut events = self.store.subscribe();
        let mut resync = tokio::time::interval(self.resync_interval);
        let mut queue: BTreeMap<Request, Instant> = BTreeMap::new();

        info!(%kind, "Starting local runner");

        loop {
            let next_due = queue.values().min().copied();

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = resync.tick() => self.enqueue_all(&mut queue).await,
                event = events.recv() => match event {
                    Ok(notification) => {
                        if let Some(request) = route(&kind, &notification) {
                            schedule(&mut queue, request, Instant::now());
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Notifications lagged, resyncing");
                        self.enqueue_all(&mut queue).await;
                    }
                    Err(RecvError::Closed) => break,
                },
                _ = sleep_until(next_due) => {
                    let now = Instant::now();
                    let due: Vec<Request> = queue
                        .iter()
                        .filter(|(_, at)| **at <= now)
                        .map(|(request, _)| request.clone())
                        .collect();
                    for request in due {
                        queue.remove(&request);
                        self.dispatch(&mut queue, request, &shutdown).await;
                    }
                }
            }
        }

        info!(%kind, "Local runner stopped");
    }

    async fn enqueue_all(&self, queue: &mut BTreeMap<Request, Instant>) {
        match self.store.list::<R::Resource>(None).await {
            Ok(records) => {
                let now = Instant::now();
                for record in &records {
                    schedule(queue, Request::from_object(record), now);
                }
            }
            Err(e) => warn!(error = %e, "Resync listing failed"),
        }
    }

    async fn dispatch(
        &self,
        queue: &mut BTreeMap<Request, Instant>,
        request: Request,
        shutdown: &CancellationToken,
    ) {
        match self.reconciler.reconcile(&request, shutdown).await {
            Ok(Action::RequeueAfter(delay)) => {
                debug!(%request, ?delay, "Requeue requested");
                schedule(queue, request, Instant::now() + delay);
            }
            Ok(Action::AwaitChange) => {}
            Err(e) if e.is_retryable() => {
                warn!(%request, error = %e, "Reconciliation failed, retrying");
                schedule(queue, request, Instant::now() + self.error_requeue);
            }
            Err(e) => warn!(%request, error = %e, "Reconciliation parked"),
        }
    }
}

/// Maps a notification to the record of `kind` it concerns, if any.
fn route(kind: &str, notification: &Notification) -> Option<Request> {
    if notification.key.kind == kind {
        return Some(Request::new(
            notification.key.namespace.clone(),
            notification.key.name.clone(),
        ));
    }
    notification
        .owners
        .iter()
        .find(|owner| owner.kind == kind)
        .map(|owner| Request::new(owner.namespace.clone(), owner.name.clone()))
}

fn schedule(queue: &mut BTreeMap<Request, Instant>, request: Request, at: Instant) {
    queue
        .entry(request)
        .and_modify(|due| *due = (*due).min(at))
        .or_insert(at);
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use unito_operator_core::ObjectKey;

    #[test]
    fn routes_own_kind_and_owned_children() {
        let own = Notification {
            key: ObjectKey::new("MySQL", "default", "db"),
            owners: vec![],
            removed: false,
        };
        let child = Notification {
            key: ObjectKey::new("Pod", "default", "mysql-uid-db"),
            owners: vec![ObjectKey::new("MySQL", "default", "db")],
            removed: false,
        };
        let unrelated = Notification {
            key: ObjectKey::new("Pod", "default", "other"),
            owners: vec![],
            removed: false,
        };

        assert_eq!(route("MySQL", &own), Some(Request::new("default", "db")));
        assert_eq!(route("MySQL", &child), Some(Request::new("default", "db")));
        assert_eq!(route("MySQL", &unrelated), None);
    }

    #[test]
    fn schedule_keeps_earliest_deadline() {
        let mut queue = BTreeMap::new();
        let now = Instant::now();
        let request = Request::new("default", "db");

        schedule(&mut queue, request.clone(), now + Duration::from_secs(5));
        schedule(&mut queue, request.clone(), now);
        schedule(&mut queue, request.clone(), now + Duration::from_secs(9));

        assert_eq!(queue.len(), 1);
        assert_eq!(queue[&request], now);
    }
}
