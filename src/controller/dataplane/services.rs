//! Admin API and ingress Services for a cohort

use crate::controller::dataplane::reconcile::{Context, ReconcileError};
use crate::controller::labels::{selector_labels, ChildLabels, CohortState, ServiceKind};
use crate::controller::owned::{
    child_meta, create_child, delete_owned, list_for_owner, reduce_to_one, replace_child, ChildName,
    EnsureResult, OwnedKind,
};
use crate::crd::DataPlane;
use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Port of the proxy admin API
pub const ADMIN_API_PORT: i32 = 8444;

/// Proxy container ports the default ingress ports forward to
pub const PROXY_HTTP_PORT: i32 = 8000;
pub const PROXY_HTTPS_PORT: i32 = 8443;

pub const DEFAULT_INGRESS_SERVICE_TYPE: &str = "LoadBalancer";

fn port(name: &str, port: i32, target: IntOrString, node_port: Option<i32>) -> ServicePort {
    ServicePort {
        name: Some(name.to_string()),
        port,
        target_port: Some(target),
        node_port,
        protocol: Some("TCP".to_string()),
        ..Default::default()
    }
}

/// Headless Service in front of the cohort's admin API
pub fn generate_admin_service(dataplane: &DataPlane, state: CohortState, token: &str) -> Service {
    let name = dataplane.name_any();
    Service {
        metadata: child_meta(
            dataplane,
            ChildName::Generate(format!("dataplane-admin-{}-", name)),
            ChildLabels::service(&name, state, ServiceKind::Admin).to_map(),
        ),
        spec: Some(ServiceSpec {
            cluster_ip: Some("None".to_string()),
            selector: Some(selector_labels(&name, token)),
            publish_not_ready_addresses: Some(true),
            ports: Some(vec![port(
                "admin",
                ADMIN_API_PORT,
                IntOrString::Int(ADMIN_API_PORT),
                None,
            )]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Ingress Service for a cohort
///
/// The live Service takes its name, type and traffic policy from the spec;
/// the preview Service is always a generated-name ClusterIP.
pub fn generate_ingress_service(dataplane: &DataPlane, state: CohortState, token: &str) -> Service {
    let name = dataplane.name_any();
    let options = dataplane.ingress_options().cloned().unwrap_or_default();

    let child_name = match (state, options.name.as_ref()) {
        (CohortState::Live, Some(fixed)) => ChildName::Fixed(fixed.clone()),
        _ => ChildName::Generate(format!("dataplane-ingress-{}-", name)),
    };

    let (service_type, external_traffic_policy) = match state {
        CohortState::Live => (
            options
                .service_type
                .clone()
                .unwrap_or_else(|| DEFAULT_INGRESS_SERVICE_TYPE.to_string()),
            options.external_traffic_policy.clone(),
        ),
        CohortState::Preview => ("ClusterIP".to_string(), None),
    };
    let exposes_node_ports = service_type != "ClusterIP";

    let ports = if options.ports.is_empty() {
        vec![
            port("http", 80, IntOrString::Int(PROXY_HTTP_PORT), None),
            port("https", 443, IntOrString::Int(PROXY_HTTPS_PORT), None),
        ]
    } else {
        options
            .ports
            .iter()
            .map(|p| {
                port(
                    &p.name,
                    p.port,
                    p.target_port.clone().unwrap_or(IntOrString::Int(p.port)),
                    p.node_port.filter(|_| exposes_node_ports),
                )
            })
            .collect()
    };

    let mut metadata = child_meta(
        dataplane,
        child_name,
        ChildLabels::service(&name, state, ServiceKind::Ingress).to_map(),
    );
    metadata.annotations = options.annotations.clone();

    Service {
        metadata,
        spec: Some(ServiceSpec {
            type_: Some(service_type),
            external_traffic_policy,
            selector: Some(selector_labels(&name, token)),
            ports: Some(ports),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn merge_into(target: &mut Option<BTreeMap<String, String>>, desired: Option<&BTreeMap<String, String>>) {
    if let Some(desired) = desired {
        let target = target.get_or_insert_with(BTreeMap::new);
        for (k, v) in desired {
            target.insert(k.clone(), v.clone());
        }
    }
}

/// Desired ports, keeping node ports the platform assigned when the spec
/// leaves them open
fn merge_ports(existing: Option<&Vec<ServicePort>>, desired: &[ServicePort], keep_node_ports: bool) -> Vec<ServicePort> {
    desired
        .iter()
        .map(|want| {
            let mut port = want.clone();
            if port.node_port.is_none() && keep_node_ports {
                port.node_port = existing
                    .and_then(|ports| ports.iter().find(|p| p.name == want.name))
                    .and_then(|p| p.node_port);
            }
            port
        })
        .collect()
}

/// The existing Service with every field we manage set to its desired value
///
/// Fields the platform fills in (cluster IPs, assigned node ports, traffic
/// policy unless the spec asks for something other than `Cluster`) are
/// carried over from `existing`.
pub fn merge_service(existing: &Service, desired: &Service) -> Service {
    let mut updated = existing.clone();

    merge_into(&mut updated.metadata.labels, desired.metadata.labels.as_ref());
    merge_into(&mut updated.metadata.annotations, desired.metadata.annotations.as_ref());
    if updated.metadata.owner_references.as_ref().map_or(true, |r| r.is_empty()) {
        updated.metadata.owner_references = desired.metadata.owner_references.clone();
    }

    let want = desired.spec.clone().unwrap_or_default();
    let spec = updated.spec.get_or_insert_with(ServiceSpec::default);
    if want.type_.is_some() {
        spec.type_ = want.type_.clone();
    }
    spec.selector = want.selector.clone();
    if want.publish_not_ready_addresses.is_some() {
        spec.publish_not_ready_addresses = want.publish_not_ready_addresses;
    }
    // `Cluster` is the platform default and is never forced over another value
    if want.external_traffic_policy.as_deref().is_some_and(|p| p != "Cluster") {
        spec.external_traffic_policy = want.external_traffic_policy.clone();
    }
    let keep_node_ports = want.type_.as_deref() != Some("ClusterIP");
    spec.ports = Some(merge_ports(
        spec.ports.as_ref(),
        want.ports.as_deref().unwrap_or_default(),
        keep_node_ports,
    ));

    updated
}

/// Ensure exactly one Service of `kind` exists for the cohort and matches
/// `desired`
///
/// When the Service has a fixed name that differs from the one found, the
/// old one is deleted and recreated on the next pass.
async fn ensure_service(
    ctx: &Context,
    dataplane: &DataPlane,
    state: CohortState,
    kind: ServiceKind,
    desired: Service,
) -> Result<(EnsureResult, Service), ReconcileError> {
    let name = dataplane.name_any();
    let store = ctx.store.as_ref();
    let labels = ChildLabels::service(&name, state, kind).to_map();
    let fixed_name = desired.metadata.name.clone();

    let mut existing = list_for_owner::<Service>(store, dataplane, &labels).await?;

    if existing.len() > 1 {
        let count = reduce_to_one(store, ctx.pre_delete.as_ref(), existing, fixed_name.as_deref()).await?;
        return Err(ReconcileError::Reduced {
            kind: OwnedKind::Service,
            state,
            dataplane: name,
            count,
        });
    }

    let Some(current) = existing.pop() else {
        let created = create_child(store, desired).await?;
        info!(
            dataplane = ?name,
            service = ?created.name_any(),
            kind = kind.as_str(),
            state = state.as_str(),
            "Created Service"
        );
        return Ok((EnsureResult::Created, created));
    };

    if let Some(fixed) = fixed_name.as_deref() {
        if current.name_any() != fixed {
            info!(
                dataplane = ?name,
                service = ?current.name_any(),
                wanted = ?fixed,
                "Service name changed, deleting old Service"
            );
            delete_owned(store, ctx.pre_delete.as_ref(), current.clone()).await?;
            return Ok((EnsureResult::Deleted, current));
        }
    }

    let updated = merge_service(&current, &desired);
    if updated == current {
        debug!(dataplane = ?name, service = ?current.name_any(), "Service up to date");
        return Ok((EnsureResult::Noop, current));
    }

    let replaced = replace_child(store, updated).await?;
    info!(
        dataplane = ?name,
        service = ?replaced.name_any(),
        kind = kind.as_str(),
        state = state.as_str(),
        "Updated Service"
    );
    Ok((EnsureResult::Updated, replaced))
}

pub async fn ensure_admin_service(
    ctx: &Context,
    dataplane: &DataPlane,
    state: CohortState,
    token: &str,
) -> Result<(EnsureResult, Service), ReconcileError> {
    let desired = generate_admin_service(dataplane, state, token);
    ensure_service(ctx, dataplane, state, ServiceKind::Admin, desired).await
}

pub async fn ensure_ingress_service(
    ctx: &Context,
    dataplane: &DataPlane,
    state: CohortState,
    token: &str,
) -> Result<(EnsureResult, Service), ReconcileError> {
    let desired = generate_ingress_service(dataplane, state, token);
    ensure_service(ctx, dataplane, state, ServiceKind::Ingress, desired).await
}

/// Cluster IP assigned to a Service, if any
pub fn cluster_ip(service: &Service) -> Option<&str> {
    service
        .spec
        .as_ref()
        .and_then(|s| s.cluster_ip.as_deref())
        .filter(|ip| !ip.is_empty() && *ip != "None")
}

/// Selector token a Service currently routes to
pub fn service_selector_token(service: &Service) -> Option<&str> {
    service
        .spec
        .as_ref()
        .and_then(|s| s.selector.as_ref())
        .and_then(|s| s.get(crate::controller::labels::SELECTOR_LABEL))
        .map(String::as_str)
}
