use crate::config::OperatorConfig;
use crate::controller::clock::Clock;
use crate::controller::dataplane::bluegreen;
use crate::controller::dataplane::deployment::DeploymentCallbacks;
use crate::controller::dataplane::orphans::release_orphans;
use crate::controller::dataplane::validation::validate_dataplane;
use crate::controller::extensions::{
    ConfigMapPlugins, ExtensionError, ExtensionProcessor, NoOpExtensions, PluginResolver, PreDeleteHook,
    StripFinalizerHook,
};
use crate::controller::labels::CohortState;
use crate::controller::owned::OwnedKind;
use crate::controller::pki::PkiError;
use crate::controller::store::{ClusterStore, StoreError};
use crate::crd::DataPlane;
use crate::server::SharedMetrics;
use kube::runtime::controller::Action;
use kube::ResourceExt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info};

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("DataPlane missing namespace")]
    MissingNamespace,

    /// Duplicates were deleted; the handle the caller held is stale
    #[error("reduced {count} duplicate {state} {kind} objects of DataPlane {dataplane}")]
    Reduced {
        kind: OwnedKind,
        state: CohortState,
        dataplane: String,
        count: usize,
    },

    #[error("found {count} {state} {kind} objects of DataPlane {dataplane}, expected at most one")]
    Multiplicity {
        kind: OwnedKind,
        state: CohortState,
        dataplane: String,
        count: usize,
    },

    #[error("unsupported image {image}: {reason}")]
    UnsupportedImage { image: String, reason: String },

    #[error("unknown promotion strategy: {0}")]
    UnknownPromotionStrategy(String),

    #[error("Invalid DataPlane spec: {0}")]
    Validation(String),

    #[error("invalid pod template override: {0}")]
    PodTemplate(#[source] serde_json::Error),

    #[error("deployment callbacks failed: {}", .0.join("; "))]
    Callbacks(Vec<String>),

    #[error("admin API certificate: {0}")]
    Pki(#[from] PkiError),

    #[error(transparent)]
    Extension(#[from] ExtensionError),

    #[error("promotion failed: {0}")]
    Promotion(String),
}

pub struct Context {
    pub store: Arc<dyn ClusterStore>,
    pub config: OperatorConfig,
    pub clock: Arc<dyn Clock>,
    pub extensions: Arc<dyn ExtensionProcessor>,
    pub plugins: Arc<dyn PluginResolver>,
    pub pre_delete: Arc<dyn PreDeleteHook>,
    pub callbacks: DeploymentCallbacks,
    /// Optional controller metrics for Prometheus
    pub metrics: Option<SharedMetrics>,
}

impl Context {
    /// Context with the default collaborators
    pub fn new(
        store: Arc<dyn ClusterStore>,
        config: OperatorConfig,
        clock: Arc<dyn Clock>,
        metrics: Option<SharedMetrics>,
    ) -> Self {
        Context {
            store,
            config,
            clock,
            extensions: Arc::new(NoOpExtensions),
            plugins: Arc::new(ConfigMapPlugins),
            pre_delete: Arc::new(StripFinalizerHook),
            callbacks: DeploymentCallbacks::default(),
            metrics,
        }
    }

    #[cfg(test)]
    pub fn new_mock(
        store: Arc<crate::controller::store_mock::MockStore>,
        clock: Arc<crate::controller::clock::MockClock>,
    ) -> Self {
        Context::new(store, OperatorConfig::default(), clock, None)
    }
}

/// Reconcile a DataPlane
///
/// Every pass performs at most one mutation and returns; the watch event
/// that mutation produces drives the next pass. Errors go to the
/// controller's error policy and are retried with backoff.
pub async fn reconcile(dataplane: Arc<DataPlane>, ctx: Arc<Context>) -> Result<Action, ReconcileError> {
    let start_time = std::time::Instant::now();

    let namespace = dataplane
        .namespace()
        .ok_or(ReconcileError::MissingNamespace)?;
    let name = dataplane.name_any();

    debug!(dataplane = ?name, namespace = ?namespace, "Reconciling DataPlane");

    let result = match reconcile_dataplane(&ctx, &namespace, &name).await {
        Err(ReconcileError::Store(StoreError::Conflict(what))) => {
            debug!(dataplane = ?name, conflict = ?what, "Write conflict, waiting for next event");
            Ok(Action::await_change())
        }
        Err(ReconcileError::Store(StoreError::NotFound(what))) => {
            debug!(dataplane = ?name, missing = ?what, "Object disappeared mid-reconcile");
            Ok(Action::await_change())
        }
        other => other,
    };

    if result.is_ok() {
        if let Some(ref metrics) = ctx.metrics {
            metrics.record_reconciliation("success", start_time.elapsed().as_secs_f64());
        }
    }

    result
}

async fn reconcile_dataplane(ctx: &Context, namespace: &str, name: &str) -> Result<Action, ReconcileError> {
    // Work from a fresh read so status writes carry a current resourceVersion
    let dataplane = match ctx.store.get_dataplane(namespace, name).await {
        Ok(dataplane) => dataplane,
        Err(StoreError::NotFound(_)) => {
            let released = release_orphans(ctx, namespace, name).await?;
            if released > 0 {
                info!(dataplane = ?name, namespace = ?namespace, released, "Released children of deleted DataPlane");
            }
            return Ok(Action::await_change());
        }
        Err(e) => return Err(e.into()),
    };

    if dataplane.metadata.deletion_timestamp.is_some() {
        release_orphans(ctx, namespace, name).await?;
        return Ok(Action::await_change());
    }

    if let Err(validation_error) = validate_dataplane(&dataplane) {
        error!(
            dataplane = ?name,
            error = ?validation_error,
            "DataPlane spec validation failed"
        );
        return Err(ReconcileError::Validation(validation_error));
    }

    bluegreen::reconcile(ctx, &dataplane).await
}
