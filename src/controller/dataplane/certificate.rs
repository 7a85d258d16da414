//! mTLS certificate Secret for a cohort's admin API

use crate::controller::dataplane::reconcile::{Context, ReconcileError};
use crate::controller::labels::{ChildLabels, CohortState};
use crate::controller::owned::{
    child_meta, create_child, list_for_owner, reduce_to_one, replace_child, ChildName, EnsureResult, OwnedKind,
};
use crate::controller::pki::{
    inspect, load_ca, needs_renewal, secret_value, CertificateAuthority, SECRET_CA_CERT_KEY, SECRET_TLS_CERT_KEY,
    SECRET_TLS_KEY_KEY,
};
use crate::crd::DataPlane;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use kube::ResourceExt;
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Subject and SANs of the admin certificate for a Service
pub fn admin_certificate_names(service: &str, namespace: &str) -> (String, Vec<String>) {
    let common_name = format!("{}.{}.svc", service, namespace);
    let dns_names = vec![
        service.to_string(),
        format!("{}.{}", service, namespace),
        common_name.clone(),
        format!("{}.cluster.local", common_name),
    ];
    (common_name, dns_names)
}

/// Why an existing certificate Secret must be re-issued, if it must
pub fn reissue_reason(
    secret: &Secret,
    ca: &CertificateAuthority,
    common_name: &str,
    now: DateTime<Utc>,
) -> Option<String> {
    for key in [SECRET_CA_CERT_KEY, SECRET_TLS_CERT_KEY, SECRET_TLS_KEY_KEY] {
        if secret_value(secret, key).is_none() {
            return Some(format!("missing {}", key));
        }
    }

    if secret_value(secret, SECRET_CA_CERT_KEY).as_deref() != Some(ca.cert_pem.as_str()) {
        return Some("signed by a different CA".to_string());
    }

    let cert_pem = secret_value(secret, SECRET_TLS_CERT_KEY).unwrap_or_default();
    match inspect(&cert_pem) {
        Err(e) => Some(e.to_string()),
        Ok(info) if info.common_name.as_deref() != Some(common_name) => Some(format!(
            "subject {} does not match {}",
            info.common_name.unwrap_or_default(),
            common_name
        )),
        Ok(info) if needs_renewal(info.not_after, now) => Some(format!("expires at {}", info.not_after)),
        Ok(_) => None,
    }
}

fn certificate_data(
    ca: &CertificateAuthority,
    common_name: &str,
    dns_names: &[String],
) -> Result<BTreeMap<String, ByteString>, ReconcileError> {
    let issued = ca.issue(common_name, dns_names)?;
    Ok(BTreeMap::from([
        (
            SECRET_CA_CERT_KEY.to_string(),
            ByteString(ca.cert_pem.as_bytes().to_vec()),
        ),
        (
            SECRET_TLS_CERT_KEY.to_string(),
            ByteString(issued.cert_pem.into_bytes()),
        ),
        (
            SECRET_TLS_KEY_KEY.to_string(),
            ByteString(issued.key_pem.into_bytes()),
        ),
    ]))
}

/// Ensure the cohort has one certificate Secret valid for `admin_service`
pub async fn ensure_certificate(
    ctx: &Context,
    dataplane: &DataPlane,
    state: CohortState,
    admin_service: &str,
) -> Result<(EnsureResult, Secret), ReconcileError> {
    let name = dataplane.name_any();
    let namespace = dataplane.namespace().unwrap_or_default();
    let store = ctx.store.as_ref();
    let labels = ChildLabels::new(&name, state).to_map();

    let mut existing = list_for_owner::<Secret>(store, dataplane, &labels).await?;
    if existing.len() > 1 {
        let count = reduce_to_one(store, ctx.pre_delete.as_ref(), existing, None).await?;
        return Err(ReconcileError::Reduced {
            kind: OwnedKind::Secret,
            state,
            dataplane: name,
            count,
        });
    }

    let ca = load_ca(store, &ctx.config.cluster_ca_namespace, &ctx.config.cluster_ca_secret).await?;
    let (common_name, dns_names) = admin_certificate_names(admin_service, &namespace);

    let Some(current) = existing.pop() else {
        let secret = Secret {
            metadata: child_meta(
                dataplane,
                ChildName::Generate(format!("dataplane-admin-mtls-{}-", name)),
                labels,
            ),
            type_: Some("kubernetes.io/tls".to_string()),
            data: Some(certificate_data(&ca, &common_name, &dns_names)?),
            ..Default::default()
        };
        let created = create_child(store, secret).await?;
        info!(
            dataplane = ?name,
            secret = ?created.name_any(),
            state = state.as_str(),
            common_name = ?common_name,
            "Created admin certificate"
        );
        return Ok((EnsureResult::Created, created));
    };

    let Some(reason) = reissue_reason(&current, &ca, &common_name, ctx.clock.now()) else {
        debug!(dataplane = ?name, secret = ?current.name_any(), "Admin certificate up to date");
        return Ok((EnsureResult::Noop, current));
    };

    let mut updated = current.clone();
    updated.data = Some(certificate_data(&ca, &common_name, &dns_names)?);
    updated.type_ = Some("kubernetes.io/tls".to_string());
    let replaced = replace_child(store, updated).await?;
    info!(
        dataplane = ?name,
        secret = ?replaced.name_any(),
        reason = ?reason,
        "Re-issued admin certificate"
    );
    Ok((EnsureResult::Updated, replaced))
}
