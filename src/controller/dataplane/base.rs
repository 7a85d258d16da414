//! In-place reconciliation of the live cohort
//!
//! A linear pipeline. Every step that changes something ends the pass and
//! the watch event it causes starts the next one, so a crash at any point
//! resumes at the first step that is not yet converged.

use crate::controller::dataplane::certificate::ensure_certificate;
use crate::controller::dataplane::deployment::{ensure_deployment, DeploymentRequest};
use crate::controller::dataplane::reconcile::{Context, ReconcileError};
use crate::controller::dataplane::scaling::{ensure_hpa, ensure_pdb};
use crate::controller::dataplane::services::{cluster_ip, ensure_admin_service, ensure_ingress_service};
use crate::controller::dataplane::status::{ensure_ready_status, patch_status_if_changed};
use crate::controller::extensions::{ExtensionError, ExtensionOutcome, PluginMount, PluginResolution};
use crate::controller::labels::CohortState;
use crate::crd::dataplane::{Address, AddressSourceType, AddressType};
use crate::crd::DataPlane;
use k8s_openapi::api::core::v1::Service;
use kube::runtime::controller::Action;
use kube::ResourceExt;
use tracing::{debug, info, warn};

/// Run the extension processor on a copy of the DataPlane
///
/// `None` means the pass should stop without an error: either an extension
/// asked for it or an extension is misconfigured in a way the user has to
/// fix.
pub async fn apply_extensions(ctx: &Context, dataplane: &DataPlane) -> Result<Option<DataPlane>, ReconcileError> {
    let mut processed = dataplane.clone();
    match ctx.extensions.apply(&mut processed).await {
        Ok(ExtensionOutcome::Continue) => Ok(Some(processed)),
        Ok(ExtensionOutcome::Stop) => {
            debug!(dataplane = ?dataplane.name_any(), "Extensions requested stop");
            Ok(None)
        }
        Err(ExtensionError::Extension(message)) => {
            warn!(dataplane = ?dataplane.name_any(), error = ?message, "Extension not ready");
            Ok(None)
        }
        Err(e) => Err(e.into()),
    }
}

/// Resolve plugin config maps, or the delay after which to try again
pub async fn resolve_plugins(
    ctx: &Context,
    dataplane: &DataPlane,
) -> Result<Result<Vec<PluginMount>, Action>, ReconcileError> {
    match ctx.plugins.resolve(ctx.store.as_ref(), dataplane).await? {
        PluginResolution::Ready(mounts) => Ok(Ok(mounts)),
        PluginResolution::Requeue(after) => {
            info!(dataplane = ?dataplane.name_any(), after = ?after, "Plugins not ready, requeueing");
            Ok(Err(Action::requeue(after)))
        }
    }
}

/// Addresses of an ingress Service: load balancer entries first, then the
/// cluster IP
pub fn ingress_addresses(service: &Service) -> Vec<Address> {
    let mut addresses = Vec::new();

    let ingress = service
        .status
        .as_ref()
        .and_then(|s| s.load_balancer.as_ref())
        .and_then(|lb| lb.ingress.as_ref());
    for entry in ingress.into_iter().flatten() {
        if let Some(ip) = entry.ip.as_deref().filter(|ip| !ip.is_empty()) {
            addresses.push(Address {
                address_type: AddressType::IPAddress,
                value: ip.to_string(),
                source_type: AddressSourceType::PublicLoadBalancer,
            });
        }
        if let Some(hostname) = entry.hostname.as_deref().filter(|h| !h.is_empty()) {
            addresses.push(Address {
                address_type: AddressType::Hostname,
                value: hostname.to_string(),
                source_type: AddressSourceType::PublicLoadBalancer,
            });
        }
    }

    if let Some(ip) = cluster_ip(service) {
        addresses.push(Address {
            address_type: AddressType::IPAddress,
            value: ip.to_string(),
            source_type: AddressSourceType::PrivateIP,
        });
    }

    addresses
}

/// Converge the live cohort onto the current spec
pub async fn reconcile(ctx: &Context, dataplane: &DataPlane) -> Result<Action, ReconcileError> {
    let name = dataplane.name_any();

    let Some(token) = dataplane.live_selector().map(str::to_string) else {
        let token = uuid::Uuid::new_v4().to_string();
        info!(dataplane = ?name, selector = ?token, "Initializing live selector");
        patch_status_if_changed(ctx, dataplane, |status| status.selector = Some(token)).await?;
        return Ok(Action::await_change());
    };

    let Some(processed) = apply_extensions(ctx, dataplane).await? else {
        return Ok(Action::await_change());
    };

    let (result, admin) = ensure_admin_service(ctx, &processed, CohortState::Live, &token).await?;
    if result.changed() {
        return Ok(Action::await_change());
    }

    let (result, ingress) = ensure_ingress_service(ctx, &processed, CohortState::Live, &token).await?;
    if result.changed() {
        return Ok(Action::await_change());
    }

    let service_name = ingress.name_any();
    if patch_status_if_changed(ctx, dataplane, |status| status.service = Some(service_name)).await? {
        return Ok(Action::await_change());
    }

    let (result, certificate) = ensure_certificate(ctx, &processed, CohortState::Live, &admin.name_any()).await?;
    if result.changed() {
        return Ok(Action::await_change());
    }

    if cluster_ip(&ingress).is_none() {
        info!(dataplane = ?name, service = ?ingress.name_any(), "Waiting for ingress cluster IP");
        return Ok(Action::await_change());
    }

    let addresses = ingress_addresses(&ingress);
    if patch_status_if_changed(ctx, dataplane, |status| status.addresses = addresses).await? {
        return Ok(Action::await_change());
    }

    let plugins = match resolve_plugins(ctx, &processed).await? {
        Ok(plugins) => plugins,
        Err(action) => return Ok(action),
    };

    let cert_secret = certificate.name_any();
    let request = DeploymentRequest {
        state: CohortState::Live,
        token: &token,
        cert_secret: &cert_secret,
        plugins: &plugins,
        replicas: None,
    };
    let (result, deployment) = ensure_deployment(ctx, &processed, request).await?;
    let Some(deployment) = deployment.filter(|_| !result.changed()) else {
        return Ok(Action::await_change());
    };

    if ensure_hpa(ctx, &processed, &deployment.name_any()).await?.changed() {
        return Ok(Action::await_change());
    }

    if ensure_pdb(ctx, &processed, &token).await?.changed() {
        return Ok(Action::await_change());
    }

    ensure_ready_status(ctx, dataplane, dataplane.generation()).await?;
    Ok(Action::await_change())
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{LoadBalancerIngress, LoadBalancerStatus, ServiceSpec, ServiceStatus};

    #[test]
    fn test_ingress_addresses_order() {
        let service = Service {
            spec: Some(ServiceSpec {
                cluster_ip: Some("10.0.0.1".to_string()),
                ..Default::default()
            }),
            status: Some(ServiceStatus {
                load_balancer: Some(LoadBalancerStatus {
                    ingress: Some(vec![
                        LoadBalancerIngress {
                            ip: Some("6.7.8.9".to_string()),
                            ..Default::default()
                        },
                        LoadBalancerIngress {
                            hostname: Some("lb.example.com".to_string()),
                            ..Default::default()
                        },
                    ]),
                }),
                ..Default::default()
            }),
            ..Default::default()
        };

        let addresses = ingress_addresses(&service);
        assert_eq!(
            addresses,
            vec![
                Address {
                    address_type: AddressType::IPAddress,
                    value: "6.7.8.9".to_string(),
                    source_type: AddressSourceType::PublicLoadBalancer,
                },
                Address {
                    address_type: AddressType::Hostname,
                    value: "lb.example.com".to_string(),
                    source_type: AddressSourceType::PublicLoadBalancer,
                },
                Address {
                    address_type: AddressType::IPAddress,
                    value: "10.0.0.1".to_string(),
                    source_type: AddressSourceType::PrivateIP,
                },
            ]
        );
    }

    #[test]
    fn test_headless_service_has_no_addresses() {
        let service = Service {
            spec: Some(ServiceSpec {
                cluster_ip: Some("None".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(ingress_addresses(&service).is_empty());
    }
}
