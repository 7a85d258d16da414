//! Blue/green rollouts
//!
//! A preview cohort (admin Service, certificate, ingress Service and
//! Deployment) is built for every new generation next to the live one.
//! Once it is ready and the promotion gate opens, traffic moves by changing
//! the selector token the live Services route to, and the preview
//! Deployment is relabeled live in place.
//!
//! ```text
//! Initialized ─► Progressing ─► AwaitingPromotion ─► PromotionInProgress ─► PromotionDone ─► WaitingForChange
//!                                        ▲                    │
//!                                        └── PromotionFailed ◄┘
//! ```

use crate::controller::dataplane::base::{self, apply_extensions, resolve_plugins};
use crate::controller::dataplane::certificate::ensure_certificate;
use crate::controller::dataplane::deployment::{
    all_replicas_ready, delete_deployments, deployment_selector_token, ensure_deployment, DeploymentRequest,
};
use crate::controller::dataplane::reconcile::{Context, ReconcileError};
use crate::controller::dataplane::services::{
    cluster_ip, ensure_admin_service, ensure_ingress_service, service_selector_token,
};
use crate::controller::dataplane::status::{
    ensure_ready_status, patch_status_if_changed, rollout_condition, set_condition, set_rollout_condition,
};
use crate::controller::labels::{ChildLabels, CohortState, ServiceKind, STATE_LABEL};
use crate::controller::owned::{delete_owned, list_for_owner, reduce_to_one, replace_child, OwnedResource};
use crate::controller::store::StoreError;
use crate::crd::dataplane::{
    Address, AddressSourceType, AddressType, BlueGreenStrategy, ConditionStatus, DeploymentPlan,
    PromotionStrategy, RolloutReason, RolloutServiceStatus, RolloutStatus, PROMOTE_WHEN_READY_ANNOTATION,
};
use crate::crd::DataPlane;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Secret, Service};
use kube::runtime::controller::Action;
use kube::ResourceExt;
use tracing::{debug, info, warn};

/// Reconcile a DataPlane, running the rollout when one is configured
pub async fn reconcile(ctx: &Context, dataplane: &DataPlane) -> Result<Action, ReconcileError> {
    let Some(strategy) = dataplane.blue_green() else {
        if cleanup_preview(ctx, dataplane).await? {
            return Ok(Action::await_change());
        }
        if patch_status_if_changed(ctx, dataplane, |status| status.rollout = None).await? {
            info!(dataplane = ?dataplane.name_any(), "Rollout disabled, cleared rollout status");
            return Ok(Action::await_change());
        }
        return base::reconcile(ctx, dataplane).await;
    };

    if resume_cutover(ctx, dataplane).await? {
        return Ok(Action::await_change());
    }

    if delegate_to_base(dataplane) {
        return base::reconcile(ctx, dataplane).await;
    }

    reconcile_rollout(ctx, dataplane, strategy).await
}

/// Finish the cutover steps a promotion left behind when its pass was cut
/// short; true if something was written
///
/// Cutover spans several writes. Once `status.selector` names a live
/// Deployment any other live Deployment is the one it replaced, and once the
/// generation is promoted the promote annotation has been consumed.
async fn resume_cutover(ctx: &Context, dataplane: &DataPlane) -> Result<bool, ReconcileError> {
    let name = dataplane.name_any();
    let store = ctx.store.as_ref();

    if let Some(token) = dataplane.live_selector() {
        let live =
            list_for_owner::<Deployment>(store, dataplane, &ChildLabels::new(&name, CohortState::Live).to_map())
                .await?;
        let replaced = live.len() > 1 && live.iter().any(|d| deployment_selector_token(d) != Some(token));
        let keep = live
            .iter()
            .find(|d| deployment_selector_token(d) == Some(token))
            .map(|d| d.name_any());
        if let Some(keep) = keep.filter(|_| replaced) {
            let deleted = reduce_to_one(store, ctx.pre_delete.as_ref(), live, Some(&keep)).await?;
            info!(dataplane = ?name, deployment = ?keep, deleted, "Removed live Deployment replaced by an unfinished promotion");
            return Ok(true);
        }
    }

    if settled(dataplane) && dataplane.annotations().contains_key(PROMOTE_WHEN_READY_ANNOTATION) {
        store
            .remove_dataplane_annotation(dataplane, PROMOTE_WHEN_READY_ANNOTATION)
            .await?;
        info!(dataplane = ?name, "Removed promote annotation left after promotion");
        return Ok(true);
    }

    Ok(false)
}

/// Whether the live cohort alone decides this pass
///
/// True when nothing is known about readiness yet, when the live cohort is
/// still coming up at the current generation, or when the current
/// generation has been rolled out and is serving.
fn delegate_to_base(dataplane: &DataPlane) -> bool {
    let generation = dataplane.generation();
    let Some(ready) = dataplane.ready_condition() else {
        return true;
    };

    let ready_now = ready.observed_generation == Some(generation);
    if ready_now && ready.status != ConditionStatus::True {
        return true;
    }

    ready_now && dataplane.current_rollout_reason() == Some(RolloutReason::WaitingForChange)
}

/// True once the current generation has been promoted
fn settled(dataplane: &DataPlane) -> bool {
    matches!(
        dataplane.current_rollout_reason(),
        Some(RolloutReason::PromotionDone) | Some(RolloutReason::WaitingForChange)
    )
}

async fn reconcile_rollout(
    ctx: &Context,
    dataplane: &DataPlane,
    strategy: &BlueGreenStrategy,
) -> Result<Action, ReconcileError> {
    let name = dataplane.name_any();
    let generation = dataplane.generation();

    // Until promotion, Ready keeps describing the generation that is serving
    let readiness_generation = if settled(dataplane) {
        generation
    } else {
        dataplane
            .ready_condition()
            .and_then(|c| c.observed_generation)
            .unwrap_or(generation)
    };
    if ensure_ready_status(ctx, dataplane, readiness_generation).await? {
        return Ok(Action::await_change());
    }

    // First bring-up: the live cohort already is this generation
    if dataplane.rolled_out_condition().is_none() {
        let ready_now = dataplane
            .ready_condition()
            .is_some_and(|c| c.status == ConditionStatus::True && c.observed_generation == Some(generation));
        if ready_now {
            set_rollout_condition(ctx, dataplane, RolloutReason::WaitingForChange, "live cohort is ready").await?;
            return Ok(Action::await_change());
        }
    }

    if let (Some(live), Some(preview)) = (dataplane.live_selector(), dataplane.preview_selector()) {
        if live == preview {
            return promote(ctx, dataplane, preview).await;
        }
    }

    let Some(token) = dataplane.preview_selector().map(str::to_string) else {
        let token = uuid::Uuid::new_v4().to_string();
        info!(dataplane = ?name, selector = ?token, "Initializing preview selector");
        patch_status_if_changed(ctx, dataplane, |status| {
            status.rollout.get_or_insert_with(RolloutStatus::default).deployment.selector = Some(token);
        })
        .await?;
        return Ok(Action::await_change());
    };

    let stale = dataplane
        .rolled_out_condition()
        .map_or(true, |c| c.observed_generation != Some(generation));
    if stale {
        set_rollout_condition(ctx, dataplane, RolloutReason::Initialized, "rollout initialized").await?;
        return Ok(Action::await_change());
    }

    let preview = match ensure_preview(ctx, dataplane, strategy, &token).await? {
        Preview::Pending(action) => return Ok(action),
        Preview::Ready(deployment) => deployment,
    };

    match dataplane.current_rollout_reason() {
        Some(RolloutReason::PromotionDone) => {
            set_rollout_condition(ctx, dataplane, RolloutReason::WaitingForChange, "waiting for spec change").await?;
            return Ok(Action::await_change());
        }
        Some(RolloutReason::WaitingForChange) => return Ok(Action::await_change()),
        _ => {}
    }

    let Some(preview) = preview.filter(all_replicas_ready) else {
        set_rollout_condition(
            ctx,
            dataplane,
            RolloutReason::Progressing,
            "waiting for preview deployment to become ready",
        )
        .await?;
        return Ok(Action::await_change());
    };

    if !promotion_gate(dataplane, strategy)? {
        set_rollout_condition(
            ctx,
            dataplane,
            RolloutReason::AwaitingPromotion,
            format!("set annotation {}=true to promote", PROMOTE_WHEN_READY_ANNOTATION),
        )
        .await?;
        return Ok(Action::await_change());
    }

    let previously_failed = dataplane
        .rolled_out_condition()
        .is_some_and(|c| RolloutReason::parse(&c.reason) == Some(RolloutReason::PromotionFailed));
    if !previously_failed
        && set_rollout_condition(
            ctx,
            dataplane,
            RolloutReason::PromotionInProgress,
            format!("promoting deployment {}", preview.name_any()),
        )
        .await?
    {
        return Ok(Action::await_change());
    }

    // Signal intent: live Services follow status.selector
    info!(dataplane = ?name, selector = ?token, "Promoting preview cohort");
    patch_status_if_changed(ctx, dataplane, |status| status.selector = Some(token)).await?;
    Ok(Action::await_change())
}

/// Whether a ready preview cohort may be promoted
fn promotion_gate(dataplane: &DataPlane, strategy: &BlueGreenStrategy) -> Result<bool, ReconcileError> {
    match strategy.promotion.strategy {
        PromotionStrategy::AutomaticPromotion => Ok(true),
        PromotionStrategy::BreakBeforePromotion => Ok(dataplane.has_promote_annotation()),
        PromotionStrategy::Unsupported => Err(ReconcileError::UnknownPromotionStrategy(
            "unrecognized blueGreen.promotion.strategy".to_string(),
        )),
    }
}

enum Preview {
    /// A child changed or something is not ready; end the pass with this
    Pending(Action),
    /// All preview children converged; the Deployment unless it was deleted
    /// by the resource plan
    Ready(Option<Deployment>),
}

/// Converge the preview cohort onto `token`
///
/// After promotion the cohort is kept around for the next rollout, either
/// scaled to zero or without its Deployment.
async fn ensure_preview(
    ctx: &Context,
    dataplane: &DataPlane,
    strategy: &BlueGreenStrategy,
    token: &str,
) -> Result<Preview, ReconcileError> {
    let pending = Ok(Preview::Pending(Action::await_change()));

    let Some(processed) = apply_extensions(ctx, dataplane).await? else {
        return pending;
    };

    let (result, admin) = ensure_admin_service(ctx, &processed, CohortState::Preview, token).await?;
    if result.changed() {
        return pending;
    }

    let (result, certificate) = ensure_certificate(ctx, &processed, CohortState::Preview, &admin.name_any()).await?;
    if result.changed() {
        return pending;
    }

    let (result, ingress) = ensure_ingress_service(ctx, &processed, CohortState::Preview, token).await?;
    if result.changed() {
        return pending;
    }

    let services = rollout_services(&admin, &ingress);
    let published = patch_status_if_changed(ctx, dataplane, |status| {
        let rollout = status.rollout.get_or_insert_with(RolloutStatus::default);
        (rollout.services.admin_api, rollout.services.ingress) = services;
    })
    .await?;
    if published {
        return pending;
    }

    let settled = settled(dataplane);
    if settled && strategy.resources.plan.deployment == DeploymentPlan::DeleteOnPromotionRecreateOnRollout {
        if delete_deployments(ctx, dataplane, CohortState::Preview).await? > 0 {
            return pending;
        }
        return Ok(Preview::Ready(None));
    }

    let plugins = match resolve_plugins(ctx, &processed).await? {
        Ok(plugins) => plugins,
        Err(action) => return Ok(Preview::Pending(action)),
    };

    let cert_secret = certificate.name_any();
    let request = DeploymentRequest {
        state: CohortState::Preview,
        token,
        cert_secret: &cert_secret,
        plugins: &plugins,
        replicas: settled.then_some(0),
    };
    let (result, deployment) = ensure_deployment(ctx, &processed, request).await?;
    if result.changed() {
        return pending;
    }
    Ok(Preview::Ready(deployment))
}

/// Preview Service names and addresses for `status.rollout.services`
fn rollout_services(admin: &Service, ingress: &Service) -> (Option<RolloutServiceStatus>, Option<RolloutServiceStatus>) {
    let addresses = cluster_ip(ingress)
        .map(|ip| {
            vec![Address {
                address_type: AddressType::IPAddress,
                value: ip.to_string(),
                source_type: AddressSourceType::PrivateIP,
            }]
        })
        .unwrap_or_default();

    (
        Some(RolloutServiceStatus {
            name: admin.name_any(),
            addresses: Vec::new(),
        }),
        Some(RolloutServiceStatus {
            name: ingress.name_any(),
            addresses,
        }),
    )
}

/// Finish a promotion whose intent is recorded in `status.selector`
///
/// Resumable: every step checks the stored state before acting.
async fn promote(ctx: &Context, dataplane: &DataPlane, token: &str) -> Result<Action, ReconcileError> {
    let name = dataplane.name_any();
    let store = ctx.store.as_ref();

    for kind in [ServiceKind::Admin, ServiceKind::Ingress] {
        let labels = ChildLabels::service(&name, CohortState::Live, kind).to_map();
        let services = list_for_owner::<Service>(store, dataplane, &labels).await?;
        if services.len() != 1 || service_selector_token(&services[0]) != Some(token) {
            debug!(dataplane = ?name, service = kind.as_str(), "Live Service not yet switched, delegating");
            return base::reconcile(ctx, dataplane).await;
        }
    }

    match finish_promotion(ctx, dataplane, token).await {
        Ok(()) => {
            if let Some(ref metrics) = ctx.metrics {
                metrics.record_promotion();
            }
            Ok(Action::await_change())
        }
        Err(e @ ReconcileError::Store(StoreError::Conflict(_) | StoreError::NotFound(_))) => Err(e),
        Err(e) => {
            warn!(dataplane = ?name, error = %e, "Promotion failed");
            if let Err(status_error) =
                set_rollout_condition(ctx, dataplane, RolloutReason::PromotionFailed, e.to_string()).await
            {
                warn!(dataplane = ?name, error = %status_error, "Failed to record promotion failure");
            }
            Err(ReconcileError::Promotion(e.to_string()))
        }
    }
}

/// Relabel the preview Deployment live, record the promotion and drop the
/// Deployment it replaced
async fn finish_promotion(ctx: &Context, dataplane: &DataPlane, token: &str) -> Result<(), ReconcileError> {
    let name = dataplane.name_any();
    let store = ctx.store.as_ref();

    let previews: Vec<Deployment> =
        list_for_owner::<Deployment>(store, dataplane, &ChildLabels::new(&name, CohortState::Preview).to_map())
            .await?
            .into_iter()
            .filter(|d| deployment_selector_token(d) == Some(token))
            .collect();
    if previews.len() > 1 {
        warn!(
            dataplane = ?name,
            count = previews.len(),
            "More than one preview Deployment matches the selector, promoting the first"
        );
    }

    let promoted = match previews.into_iter().next() {
        Some(mut deployment) => {
            deployment
                .labels_mut()
                .insert(STATE_LABEL.to_string(), CohortState::Live.as_str().to_string());
            let relabeled = replace_child(store, deployment).await?;
            info!(dataplane = ?name, deployment = ?relabeled.name_any(), "Relabeled preview Deployment as live");
            Some(relabeled.name_any())
        }
        // Already relabeled by an earlier pass that did not finish
        None => None,
    };

    let condition = rollout_condition(dataplane, RolloutReason::PromotionDone, "promotion done".to_string());
    let now = ctx.clock.timestamp();
    patch_status_if_changed(ctx, dataplane, |status| {
        let rollout = status.rollout.get_or_insert_with(RolloutStatus::default);
        rollout.deployment.selector = None;
        set_condition(&mut rollout.conditions, condition, &now);
    })
    .await?;

    if dataplane.annotations().contains_key(PROMOTE_WHEN_READY_ANNOTATION) {
        store
            .remove_dataplane_annotation(dataplane, PROMOTE_WHEN_READY_ANNOTATION)
            .await?;
    }

    let live =
        list_for_owner::<Deployment>(store, dataplane, &ChildLabels::new(&name, CohortState::Live).to_map()).await?;
    if live.len() > 1 {
        let authoritative = promoted.or_else(|| {
            live.iter()
                .find(|d| deployment_selector_token(d) == Some(token))
                .map(|d| d.name_any())
        });
        let deleted = reduce_to_one(store, ctx.pre_delete.as_ref(), live, authoritative.as_deref()).await?;
        info!(dataplane = ?name, deleted, "Removed replaced live Deployment");
    }

    info!(dataplane = ?name, selector = ?token, generation = dataplane.generation(), "Promotion done");
    Ok(())
}

/// Delete every preview child; true if anything was deleted
async fn cleanup_preview(ctx: &Context, dataplane: &DataPlane) -> Result<bool, ReconcileError> {
    let deleted = delete_cohort::<Deployment>(ctx, dataplane).await?
        + delete_cohort::<Service>(ctx, dataplane).await?
        + delete_cohort::<Secret>(ctx, dataplane).await?;

    if deleted > 0 {
        info!(dataplane = ?dataplane.name_any(), deleted, "Rollout disabled, deleted preview children");
    }
    Ok(deleted > 0)
}

async fn delete_cohort<K: OwnedResource>(ctx: &Context, dataplane: &DataPlane) -> Result<usize, ReconcileError> {
    let name = dataplane.name_any();
    let store = ctx.store.as_ref();
    let existing = list_for_owner::<K>(store, dataplane, &ChildLabels::new(&name, CohortState::Preview).to_map()).await?;

    let count = existing.len();
    for object in existing {
        delete_owned(store, ctx.pre_delete.as_ref(), object).await?;
    }
    Ok(count)
}
