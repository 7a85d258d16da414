use dataplane_operator::config::OperatorConfig;
use dataplane_operator::controller::clock::SystemClock;
use dataplane_operator::controller::dataplane::orphans::run_orphan_watcher;
use dataplane_operator::controller::labels::{MANAGED_BY_LABEL, MANAGED_BY_VALUE};
use dataplane_operator::controller::owned::OwnedResource;
use dataplane_operator::controller::pki::ensure_ca_secret;
use dataplane_operator::controller::store::{ClusterStore, KubeStore};
use dataplane_operator::controller::{reconcile, Context, ReconcileError};
use dataplane_operator::crd::DataPlane;
use dataplane_operator::server::{
    create_metrics, run_health_server, shutdown_channel, wait_for_signal, ReadinessState, ShutdownSignal,
};
use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::autoscaling::v2::HorizontalPodAutoscaler;
use k8s_openapi::api::core::v1::{Secret, Service};
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use kube::runtime::controller::Action;
use kube::runtime::{watcher, Controller};
use kube::{Api, Client};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Requeue failed reconciles after the configured backoff
///
/// Uses `warn!` since most errors (conflicts, missing cluster IPs) are
/// transient and retried.
pub fn error_policy(dataplane: Arc<DataPlane>, error: &ReconcileError, ctx: Arc<Context>) -> Action {
    warn!(
        dataplane = ?dataplane.metadata.name,
        namespace = ?dataplane.metadata.namespace,
        error = %error,
        "Reconcile error (will retry)"
    );

    if let Some(ref metrics) = ctx.metrics {
        metrics.record_reconciliation("error", 0.0);
    }

    Action::requeue(Duration::from_secs(ctx.config.requeue_seconds))
}

/// Release finalizers on children whose DataPlane is gone, until shutdown
fn spawn_orphan_watcher<K: OwnedResource>(
    client: &Client,
    store: &Arc<dyn ClusterStore>,
    shutdown: &ShutdownSignal,
) -> JoinHandle<()> {
    let client = client.clone();
    let store = store.clone();
    let mut shutdown = shutdown.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = run_orphan_watcher::<K>(client, store) => {}
            _ = shutdown.wait() => {}
        }
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Starting DataPlane operator");

    let config = OperatorConfig::from_env()?;
    info!(
        default_image = %config.fallback_image(),
        validate_images = config.validate_images,
        health_port = config.health_port,
        "Configuration loaded"
    );

    let (shutdown_controller, shutdown_signal) = shutdown_channel();
    let readiness = ReadinessState::new();
    let metrics = create_metrics()?;

    let client = match Client::try_default().await {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "Failed to create Kubernetes client");
            return Err(e.into());
        }
    };
    info!("Connected to Kubernetes cluster");

    let store: Arc<dyn ClusterStore> = Arc::new(KubeStore::new(client.clone()));

    // Admin API certificates are signed by this CA; fail fast if it is unusable
    ensure_ca_secret(
        store.as_ref(),
        &config.cluster_ca_namespace,
        &config.cluster_ca_secret,
    )
    .await?;

    let health_readiness = readiness.clone();
    let health_metrics = metrics.clone();
    let health_port = config.health_port;
    let health_handle = tokio::spawn(async move {
        if let Err(e) = run_health_server(health_port, health_readiness, health_metrics).await {
            warn!(error = %e, "Health server failed");
        }
    });

    let orphan_handles = vec![
        spawn_orphan_watcher::<Deployment>(&client, &store, &shutdown_signal),
        spawn_orphan_watcher::<Service>(&client, &store, &shutdown_signal),
        spawn_orphan_watcher::<Secret>(&client, &store, &shutdown_signal),
        spawn_orphan_watcher::<HorizontalPodAutoscaler>(&client, &store, &shutdown_signal),
        spawn_orphan_watcher::<PodDisruptionBudget>(&client, &store, &shutdown_signal),
    ];

    let ctx = Arc::new(Context::new(
        store,
        config,
        Arc::new(SystemClock),
        Some(metrics.clone()),
    ));

    readiness.set_ready();
    info!("Controller ready, starting reconciliation loop");

    // Only watch children this operator labelled
    let managed = format!("{}={}", MANAGED_BY_LABEL, MANAGED_BY_VALUE);
    let children = || watcher::Config::default().labels(&managed);

    // error_policy logs failures, so only successes are logged here
    let controller = Controller::new(Api::<DataPlane>::all(client.clone()), watcher::Config::default())
        .owns(Api::<Deployment>::all(client.clone()), children())
        .owns(Api::<Service>::all(client.clone()), children())
        .owns(Api::<Secret>::all(client.clone()), children())
        .owns(Api::<HorizontalPodAutoscaler>::all(client.clone()), children())
        .owns(Api::<PodDisruptionBudget>::all(client.clone()), children())
        .run(reconcile, error_policy, ctx)
        .for_each(|res| async move {
            if let Ok((object, _)) = res {
                info!(dataplane = %object.name, namespace = ?object.namespace, "Reconciled");
            }
        });

    tokio::select! {
        _ = controller => {
            info!("Controller stream ended");
        }
        signal = wait_for_signal() => {
            match signal {
                Ok(name) => info!(signal = name, "Initiating graceful shutdown"),
                Err(e) => error!(error = %e, "Failed to listen for termination signals, shutting down"),
            }
            readiness.set_not_ready();
        }
    }

    shutdown_controller.shutdown();
    for handle in orphan_handles {
        if let Err(e) = handle.await {
            warn!(error = %e, "Orphan watcher task failed");
        }
    }
    health_handle.abort();

    info!("DataPlane operator shut down");
    Ok(())
}

#[cfg(test)]
#[path = "main_test.rs"]
mod tests;
