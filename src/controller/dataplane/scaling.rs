//! HorizontalPodAutoscaler and PodDisruptionBudget for the live cohort
//!
//! Both are optional: when the spec leaves them unset any existing object
//! is deleted.

use crate::controller::dataplane::reconcile::{Context, ReconcileError};
use crate::controller::labels::{selector_labels, ChildLabels, CohortState};
use crate::controller::owned::{
    child_meta, create_child, delete_owned, list_for_owner, reduce_to_one, replace_child, ChildName,
    EnsureResult, OwnedResource,
};
use crate::crd::DataPlane;
use k8s_openapi::api::autoscaling::v2::{
    CrossVersionObjectReference, HorizontalPodAutoscaler, HorizontalPodAutoscalerSpec, MetricSpec, MetricTarget,
    ResourceMetricSource,
};
use k8s_openapi::api::policy::v1::{PodDisruptionBudget, PodDisruptionBudgetSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::ResourceExt;
use tracing::{debug, info};

/// CPU utilization the API server assumes when no metric is given
const DEFAULT_CPU_UTILIZATION: i32 = 80;

fn default_metrics() -> Vec<MetricSpec> {
    vec![MetricSpec {
        type_: "Resource".to_string(),
        resource: Some(ResourceMetricSource {
            name: "cpu".to_string(),
            target: MetricTarget {
                type_: "Utilization".to_string(),
                average_utilization: Some(DEFAULT_CPU_UTILIZATION),
                ..Default::default()
            },
        }),
        ..Default::default()
    }]
}

/// Desired autoscaler for the live Deployment, if scaling is configured
pub fn generate_hpa(dataplane: &DataPlane, deployment: &str) -> Option<HorizontalPodAutoscaler> {
    let scaling = dataplane.horizontal_scaling()?;
    let name = dataplane.name_any();

    let metrics = if scaling.metrics.is_empty() {
        default_metrics()
    } else {
        scaling.metrics.clone()
    };

    Some(HorizontalPodAutoscaler {
        metadata: child_meta(
            dataplane,
            ChildName::Generate(format!("dataplane-{}-", name)),
            ChildLabels::new(&name, CohortState::Live).to_map(),
        ),
        spec: Some(HorizontalPodAutoscalerSpec {
            scale_target_ref: CrossVersionObjectReference {
                api_version: Some("apps/v1".to_string()),
                kind: "Deployment".to_string(),
                name: deployment.to_string(),
            },
            min_replicas: Some(scaling.min_replicas.unwrap_or(1)),
            max_replicas: scaling.max_replicas,
            metrics: Some(metrics),
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// Desired disruption budget for the live cohort, if configured
pub fn generate_pdb(dataplane: &DataPlane, token: &str) -> Option<PodDisruptionBudget> {
    let options = dataplane.spec.resources.pod_disruption_budget.as_ref()?;
    let name = dataplane.name_any();

    Some(PodDisruptionBudget {
        metadata: child_meta(
            dataplane,
            ChildName::Generate(format!("dataplane-{}-", name)),
            ChildLabels::new(&name, CohortState::Live).to_map(),
        ),
        spec: Some(PodDisruptionBudgetSpec {
            selector: Some(LabelSelector {
                match_labels: Some(selector_labels(&name, token)),
                ..Default::default()
            }),
            min_available: options.spec.min_available.clone(),
            max_unavailable: options.spec.max_unavailable.clone(),
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// List-reduce-create-or-update for an optional live child
///
/// `merge` returns the existing object with the managed fields set from
/// the desired one.
async fn ensure_optional<K: OwnedResource + PartialEq>(
    ctx: &Context,
    dataplane: &DataPlane,
    desired: Option<K>,
    merge: impl Fn(&K, &K) -> K,
) -> Result<EnsureResult, ReconcileError> {
    let name = dataplane.name_any();
    let store = ctx.store.as_ref();
    let labels = ChildLabels::new(&name, CohortState::Live).to_map();
    let mut existing = list_for_owner::<K>(store, dataplane, &labels).await?;

    let Some(desired) = desired else {
        if existing.is_empty() {
            return Ok(EnsureResult::Noop);
        }
        for object in existing {
            info!(dataplane = ?name, kind = %K::KIND, name = ?object.name_any(), "Deleting unconfigured child");
            delete_owned(store, ctx.pre_delete.as_ref(), object).await?;
        }
        return Ok(EnsureResult::Deleted);
    };

    if existing.len() > 1 {
        let count = reduce_to_one(store, ctx.pre_delete.as_ref(), existing, None).await?;
        return Err(ReconcileError::Reduced {
            kind: K::KIND,
            state: CohortState::Live,
            dataplane: name,
            count,
        });
    }

    let Some(current) = existing.pop() else {
        let created = create_child(store, desired).await?;
        info!(dataplane = ?name, kind = %K::KIND, name = ?created.name_any(), "Created child");
        return Ok(EnsureResult::Created);
    };

    let updated = merge(&current, &desired);
    if updated == current {
        debug!(dataplane = ?name, kind = %K::KIND, name = ?current.name_any(), "Child up to date");
        return Ok(EnsureResult::Noop);
    }

    replace_child(store, updated).await?;
    info!(dataplane = ?name, kind = %K::KIND, name = ?current.name_any(), "Updated child");
    Ok(EnsureResult::Updated)
}

pub async fn ensure_hpa(
    ctx: &Context,
    dataplane: &DataPlane,
    deployment: &str,
) -> Result<EnsureResult, ReconcileError> {
    let desired = generate_hpa(dataplane, deployment);
    ensure_optional(ctx, dataplane, desired, |current, desired| {
        let mut updated = current.clone();
        if let (Some(spec), Some(want)) = (updated.spec.as_mut(), desired.spec.as_ref()) {
            spec.scale_target_ref = want.scale_target_ref.clone();
            spec.min_replicas = want.min_replicas;
            spec.max_replicas = want.max_replicas;
            spec.metrics = want.metrics.clone();
        }
        updated
    })
    .await
}

pub async fn ensure_pdb(ctx: &Context, dataplane: &DataPlane, token: &str) -> Result<EnsureResult, ReconcileError> {
    let desired = generate_pdb(dataplane, token);
    ensure_optional(ctx, dataplane, desired, |current, desired| {
        let mut updated = current.clone();
        if let (Some(spec), Some(want)) = (updated.spec.as_mut(), desired.spec.as_ref()) {
            spec.selector = want.selector.clone();
            spec.min_available = want.min_available.clone();
            spec.max_unavailable = want.max_unavailable.clone();
        }
        updated
    })
    .await
}
