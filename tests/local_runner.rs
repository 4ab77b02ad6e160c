mod common;

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::{Pod, Service};
use unito_operator::api::MySQL;
use unito_operator::controllers::MySQLReconciler;
use unito_operator_controller::{Fault, LocalRunner, MemoryStore, Store, StoreOp};
use unito_operator_core::CancellationToken;

use common::*;

/// Polls `check` until it holds or the deadline passes.
async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

#[tokio::test]
async fn converges_from_notifications() {
    let store = Arc::new(MemoryStore::new());
    let reconciler = Arc::new(MySQLReconciler::new(Arc::clone(&store), registry(), config()));
    let shutdown = CancellationToken::new();
    let runner = LocalRunner::new(Arc::clone(&store), reconciler)
        .resync_interval(Duration::from_secs(60))
        .error_requeue(Duration::from_millis(20));
    let handle = tokio::spawn(runner.run(shutdown.clone()));

    let db = store.create(&mysql("orders", "8.0", None)).await.unwrap();
    let name = child("mysql", &db);
    let (s, n) = (store.as_ref(), name.as_str());

    assert!(eventually(|| async move { s.contains::<Pod>(NAMESPACE, n) }).await);
    assert!(eventually(|| async move { s.contains::<Service>(NAMESPACE, n) }).await);

    // The address lands on the child; the owner is re-queued through it.
    assign_cluster_ip(s, n);
    assert!(
        eventually(|| async move {
            let db: MySQL = fetch(s, "orders").await;
            db.status.is_some_and(|s| s.address == CLUSTER_IP)
        })
        .await
    );

    shutdown.cancel();
    handle.await.unwrap();
}

#[tokio::test]
async fn retries_a_record_after_a_transient_failure() {
    let store = Arc::new(MemoryStore::new());
    let reconciler = Arc::new(MySQLReconciler::new(Arc::clone(&store), registry(), config()));
    let shutdown = CancellationToken::new();
    store.inject_fault(Fault::on::<Pod>(StoreOp::Create));
    let db = store.create(&mysql("orders", "8.0", None)).await.unwrap();
    let name = child("mysql", &db);

    let runner = LocalRunner::new(Arc::clone(&store), reconciler)
        .resync_interval(Duration::from_secs(60))
        .error_requeue(Duration::from_millis(20));
    let handle = tokio::spawn(runner.run(shutdown.clone()));
    let (s, n) = (store.as_ref(), name.as_str());

    assert!(eventually(|| async move { s.contains::<Pod>(NAMESPACE, n) }).await);

    shutdown.cancel();
    handle.await.unwrap();
}
