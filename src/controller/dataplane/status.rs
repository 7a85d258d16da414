//! Status writes and the `Ready` / `RolledOut` conditions
//!
//! Every write starts from the status of the freshly read DataPlane and is
//! skipped when nothing would change, because the reconciler runs for many
//! events that do not affect status.

use crate::controller::dataplane::reconcile::{Context, ReconcileError};
use crate::controller::labels::{ChildLabels, CohortState, ServiceKind};
use crate::controller::owned::{list_for_owner, OwnedKind};
use crate::crd::dataplane::{
    Condition, ConditionStatus, RolloutReason, RolloutStatus, READY_CONDITION, READY_REASON,
    ROLLED_OUT_CONDITION, WAITING_TO_BECOME_READY_REASON,
};
use crate::crd::{DataPlane, DataPlaneStatus};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Service;
use kube::ResourceExt;
use tracing::info;

/// Insert or update a condition
///
/// `lastTransitionTime` moves only when the status value changes. Returns
/// true if the list changed.
pub fn set_condition(conditions: &mut Vec<Condition>, mut condition: Condition, now: &str) -> bool {
    match conditions.iter_mut().find(|c| c.type_ == condition.type_) {
        Some(existing) => {
            condition.last_transition_time = if existing.status == condition.status {
                existing.last_transition_time.clone()
            } else {
                Some(now.to_string())
            };
            if *existing == condition {
                return false;
            }
            *existing = condition;
            true
        }
        None => {
            condition.last_transition_time = Some(now.to_string());
            conditions.push(condition);
            true
        }
    }
}

/// Apply `update` to a copy of the status and write it if it changed
///
/// Returns true when a write happened.
pub async fn patch_status_if_changed(
    ctx: &Context,
    dataplane: &DataPlane,
    update: impl FnOnce(&mut DataPlaneStatus),
) -> Result<bool, ReconcileError> {
    let current = dataplane.status.clone().unwrap_or_default();
    let mut desired = current.clone();
    update(&mut desired);

    if desired == current {
        return Ok(false);
    }

    ctx.store.patch_dataplane_status(dataplane, &desired).await?;
    Ok(true)
}

/// Why the live cohort is or is not serving
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Readiness {
    pub ready: bool,
    pub message: String,
    pub replicas: i32,
    pub ready_replicas: i32,
}

/// True if a LoadBalancer Service has an address, or the Service is of
/// any other type
pub fn service_reachable(service: &Service) -> bool {
    let is_load_balancer = service
        .spec
        .as_ref()
        .and_then(|s| s.type_.as_deref())
        == Some("LoadBalancer");
    if !is_load_balancer {
        return true;
    }

    service
        .status
        .as_ref()
        .and_then(|s| s.load_balancer.as_ref())
        .and_then(|lb| lb.ingress.as_ref())
        .is_some_and(|ingress| {
            ingress
                .iter()
                .any(|i| i.ip.as_deref().is_some_and(|ip| !ip.is_empty()) || i.hostname.as_deref().is_some_and(|h| !h.is_empty()))
        })
}

/// Combine workload availability and endpoint reachability
pub fn evaluate_readiness(deployment: Option<&Deployment>, ingress: Option<&Service>) -> Readiness {
    let Some(deployment) = deployment else {
        return Readiness {
            ready: false,
            message: "live deployment does not exist yet".to_string(),
            replicas: 0,
            ready_replicas: 0,
        };
    };

    let status = deployment.status.clone().unwrap_or_default();
    let replicas = status.replicas.unwrap_or(0);
    let available = status.available_replicas.unwrap_or(0);
    let ready_replicas = status.ready_replicas.unwrap_or(0);

    let unavailable = replicas == 0 || available < replicas;
    let message = if unavailable {
        format!("{}/{} pods available", available, replicas)
    } else {
        match ingress {
            None => "ingress service does not exist yet".to_string(),
            Some(service) if !service_reachable(service) => {
                format!("ingress service {} has no load balancer address yet", service.name_any())
            }
            Some(_) => String::new(),
        }
    };

    Readiness {
        ready: message.is_empty(),
        message,
        replicas,
        ready_replicas,
    }
}

/// At most one live object, or a multiplicity error
fn single<K>(mut items: Vec<K>, kind: OwnedKind, dataplane: &str) -> Result<Option<K>, ReconcileError> {
    if items.len() > 1 {
        return Err(ReconcileError::Multiplicity {
            kind,
            state: CohortState::Live,
            dataplane: dataplane.to_string(),
            count: items.len(),
        });
    }
    Ok(items.pop())
}

/// Compute `Ready` from the live cohort and publish it with the replica counts
///
/// `observed_generation` is the generation recorded on the condition; the
/// blue/green reconciler passes the previous one while a rollout is in
/// flight. Returns true if the status was written.
pub async fn ensure_ready_status(
    ctx: &Context,
    dataplane: &DataPlane,
    observed_generation: i64,
) -> Result<bool, ReconcileError> {
    let name = dataplane.name_any();
    let store = ctx.store.as_ref();

    let deployments =
        list_for_owner::<Deployment>(store, dataplane, &ChildLabels::new(&name, CohortState::Live).to_map())
            .await?;
    let deployment = single(deployments, OwnedKind::Deployment, &name)?;

    let services = list_for_owner::<Service>(
        store,
        dataplane,
        &ChildLabels::service(&name, CohortState::Live, ServiceKind::Ingress).to_map(),
    )
    .await?;
    let ingress = single(services, OwnedKind::Service, &name)?;

    let readiness = evaluate_readiness(deployment.as_ref(), ingress.as_ref());
    let condition = Condition {
        type_: READY_CONDITION.to_string(),
        status: if readiness.ready {
            ConditionStatus::True
        } else {
            ConditionStatus::False
        },
        reason: if readiness.ready {
            READY_REASON
        } else {
            WAITING_TO_BECOME_READY_REASON
        }
        .to_string(),
        message: readiness.message.clone(),
        observed_generation: Some(observed_generation),
        last_transition_time: None,
    };

    let now = ctx.clock.timestamp();
    let patched = patch_status_if_changed(ctx, dataplane, |status| {
        set_condition(&mut status.conditions, condition, &now);
        status.replicas = readiness.replicas;
        status.ready_replicas = readiness.ready_replicas;
    })
    .await?;

    if patched {
        info!(
            dataplane = ?name,
            ready = readiness.ready,
            generation = observed_generation,
            message = ?readiness.message,
            "Updated Ready condition"
        );
    }
    Ok(patched)
}

/// Set `RolledOut` for the current generation; returns true if written
pub async fn set_rollout_condition(
    ctx: &Context,
    dataplane: &DataPlane,
    reason: RolloutReason,
    message: impl Into<String>,
) -> Result<bool, ReconcileError> {
    let condition = rollout_condition(dataplane, reason, message.into());
    let now = ctx.clock.timestamp();

    let patched = patch_status_if_changed(ctx, dataplane, |status| {
        let rollout = status.rollout.get_or_insert_with(RolloutStatus::default);
        set_condition(&mut rollout.conditions, condition, &now);
    })
    .await?;

    if patched {
        info!(
            dataplane = ?dataplane.name_any(),
            reason = reason.as_str(),
            generation = dataplane.generation(),
            "Updated RolledOut condition"
        );
    }
    Ok(patched)
}

/// A `RolledOut` condition for the current generation
pub fn rollout_condition(dataplane: &DataPlane, reason: RolloutReason, message: String) -> Condition {
    Condition {
        type_: ROLLED_OUT_CONDITION.to_string(),
        status: reason.condition_status(),
        reason: reason.as_str().to_string(),
        message,
        observed_generation: Some(dataplane.generation()),
        last_transition_time: None,
    }
}
