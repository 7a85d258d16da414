//! Proxy Deployment builder
//!
//! ```text
//! before callbacks ─► list/reduce ─► generate ─► cluster cert ─► after callbacks
//!        ─► user overrides ─► env defaults ─► diff ─► create | replace | noop
//! ```

use crate::controller::dataplane::image::{resolve_image, validate_image, PROXY_CONTAINER_NAME};
use crate::controller::dataplane::overrides::{apply_pod_template_overrides, set_env, set_env_default};
use crate::controller::dataplane::reconcile::{Context, ReconcileError};
use crate::controller::dataplane::services::{ADMIN_API_PORT, PROXY_HTTPS_PORT, PROXY_HTTP_PORT};
use crate::controller::extensions::PluginMount;
use crate::controller::labels::{contains_all, selector_labels, ChildLabels, CohortState, SELECTOR_LABEL};
use crate::controller::owned::{
    child_meta, create_child, delete_owned, list_for_owner, reduce_to_one, replace_child, ChildName,
    EnsureResult, OwnedKind,
};
use crate::controller::pki::{SECRET_CA_CERT_KEY, SECRET_TLS_CERT_KEY, SECRET_TLS_KEY_KEY};
use crate::crd::DataPlane;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec, DeploymentStrategy, RollingUpdateDeployment};
use k8s_openapi::api::core::v1::{
    ConfigMapVolumeSource, Container, ContainerPort, HTTPGetAction, PodSpec, PodTemplateSpec, Probe,
    SecretVolumeSource, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;
use serde_json::Value;
use tracing::{debug, info};

pub const CLUSTER_CERT_VOLUME: &str = "cluster-certificate";
pub const CLUSTER_CERT_MOUNT_PATH: &str = "/var/cluster-certificate";
pub const PLUGIN_MOUNT_ROOT: &str = "/opt/kong/plugins";
pub const STATUS_PORT: i32 = 8100;
pub const READINESS_PATH: &str = "/status/ready";

/// Mode the API server fills in for secret and config map volumes
const DEFAULT_VOLUME_MODE: i32 = 420;

/// Runs before anything is listed or generated; an error aborts the build
pub type BeforeCallback = fn(&DataPlane) -> Result<(), String>;

/// Runs on the generated Deployment before user overrides are applied
pub type AfterCallback = Box<dyn Fn(&DataPlane, &mut Deployment) -> Result<(), String> + Send + Sync>;

/// Extension points of the builder
///
/// All callbacks of a stage run even when one fails; the failures are
/// reported together.
#[derive(Default)]
pub struct DeploymentCallbacks {
    pub before: Vec<BeforeCallback>,
    pub after: Vec<AfterCallback>,
}

/// What the builder needs beyond the DataPlane itself
#[derive(Clone, Copy, Debug)]
pub struct DeploymentRequest<'a> {
    pub state: CohortState,
    pub token: &'a str,
    pub cert_secret: &'a str,
    pub plugins: &'a [PluginMount],
    /// Overrides the replica count derived from the spec
    pub replicas: Option<i32>,
}

fn tcp_port(name: &str, port: i32) -> ContainerPort {
    ContainerPort {
        name: Some(name.to_string()),
        container_port: port,
        protocol: Some("TCP".to_string()),
        ..Default::default()
    }
}

/// Readiness probe with every field the API server would otherwise default
fn readiness_probe() -> Probe {
    Probe {
        http_get: Some(HTTPGetAction {
            path: Some(READINESS_PATH.to_string()),
            port: IntOrString::Int(STATUS_PORT),
            scheme: Some("HTTP".to_string()),
            ..Default::default()
        }),
        initial_delay_seconds: Some(5),
        period_seconds: Some(10),
        timeout_seconds: Some(1),
        success_threshold: Some(1),
        failure_threshold: Some(3),
        ..Default::default()
    }
}

/// The Deployment as generated from the spec, before callbacks and overrides
pub fn generate_deployment(dataplane: &DataPlane, state: CohortState, token: &str, image: &str) -> Deployment {
    let name = dataplane.name_any();
    let pod_labels = selector_labels(&name, token);

    let container = Container {
        name: PROXY_CONTAINER_NAME.to_string(),
        image: Some(image.to_string()),
        ports: Some(vec![
            tcp_port("proxy", PROXY_HTTP_PORT),
            tcp_port("proxy-ssl", PROXY_HTTPS_PORT),
            tcp_port("admin-ssl", ADMIN_API_PORT),
            tcp_port("metrics", STATUS_PORT),
        ]),
        readiness_probe: Some(readiness_probe()),
        ..Default::default()
    };

    Deployment {
        metadata: child_meta(
            dataplane,
            ChildName::Generate(format!("dataplane-{}-", name)),
            ChildLabels::new(&name, state).to_map(),
        ),
        spec: Some(DeploymentSpec {
            selector: LabelSelector {
                match_labels: Some(pod_labels.clone()),
                ..Default::default()
            },
            strategy: Some(DeploymentStrategy {
                type_: Some("RollingUpdate".to_string()),
                rolling_update: Some(RollingUpdateDeployment {
                    max_surge: Some(IntOrString::String("25%".to_string())),
                    max_unavailable: Some(IntOrString::Int(0)),
                }),
            }),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(pod_labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![container],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn pod_spec_mut(deployment: &mut Deployment) -> &mut PodSpec {
    deployment
        .spec
        .get_or_insert_with(Default::default)
        .template
        .spec
        .get_or_insert_with(Default::default)
}

fn proxy_container_mut(spec: &mut PodSpec) -> Option<&mut Container> {
    spec.containers.iter_mut().find(|c| c.name == PROXY_CONTAINER_NAME)
}

fn push_volume(spec: &mut PodSpec, volume: Volume) {
    let volumes = spec.volumes.get_or_insert_with(Vec::new);
    volumes.retain(|v| v.name != volume.name);
    volumes.push(volume);
}

fn push_mount(container: &mut Container, mount: VolumeMount) {
    let mounts = container.volume_mounts.get_or_insert_with(Vec::new);
    mounts.retain(|m| m.name != mount.name);
    mounts.push(mount);
}

/// Mount the admin certificate Secret and point the proxy at it
pub fn inject_cluster_certificate(deployment: &mut Deployment, cert_secret: &str) {
    let spec = pod_spec_mut(deployment);
    push_volume(
        spec,
        Volume {
            name: CLUSTER_CERT_VOLUME.to_string(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(cert_secret.to_string()),
                default_mode: Some(DEFAULT_VOLUME_MODE),
                ..Default::default()
            }),
            ..Default::default()
        },
    );

    if let Some(container) = proxy_container_mut(spec) {
        push_mount(
            container,
            VolumeMount {
                name: CLUSTER_CERT_VOLUME.to_string(),
                mount_path: CLUSTER_CERT_MOUNT_PATH.to_string(),
                read_only: Some(true),
                ..Default::default()
            },
        );
        set_env(
            container,
            "KONG_CLUSTER_CERT",
            &format!("{}/{}", CLUSTER_CERT_MOUNT_PATH, SECRET_TLS_CERT_KEY),
        );
        set_env(
            container,
            "KONG_CLUSTER_CERT_KEY",
            &format!("{}/{}", CLUSTER_CERT_MOUNT_PATH, SECRET_TLS_KEY_KEY),
        );
    }
}

/// Mount each plugin's ConfigMap and enable it next to the bundled plugins
pub fn mount_plugins(deployment: &mut Deployment, plugins: &[PluginMount]) -> Result<(), String> {
    if plugins.is_empty() {
        return Ok(());
    }

    let spec = pod_spec_mut(deployment);
    for plugin in plugins {
        push_volume(
            spec,
            Volume {
                name: format!("plugin-{}", plugin.name),
                config_map: Some(ConfigMapVolumeSource {
                    name: plugin.config_map.clone(),
                    default_mode: Some(DEFAULT_VOLUME_MODE),
                    ..Default::default()
                }),
                ..Default::default()
            },
        );
    }

    let container = proxy_container_mut(spec)
        .ok_or_else(|| format!("no {} container to mount plugins into", PROXY_CONTAINER_NAME))?;
    for plugin in plugins {
        push_mount(
            container,
            VolumeMount {
                name: format!("plugin-{}", plugin.name),
                mount_path: format!("{}/{}", PLUGIN_MOUNT_ROOT, plugin.name),
                read_only: Some(true),
                ..Default::default()
            },
        );
    }

    let names: Vec<&str> = plugins.iter().map(|p| p.name.as_str()).collect();
    set_env(container, "KONG_PLUGINS", &format!("bundled,{}", names.join(",")));
    set_env(
        container,
        "KONG_LUA_PACKAGE_PATH",
        &format!("{}/?.lua;;", PLUGIN_MOUNT_ROOT),
    );
    Ok(())
}

/// Listener and admin mTLS settings, filled in only where the user left them unset
pub fn apply_env_defaults(deployment: &mut Deployment) {
    let spec = pod_spec_mut(deployment);
    let Some(container) = proxy_container_mut(spec) else {
        return;
    };

    let cert = |key: &str| format!("{}/{}", CLUSTER_CERT_MOUNT_PATH, key);
    let defaults = [
        ("KONG_ADMIN_LISTEN", format!("0.0.0.0:{} ssl reuseport backlog=16384", ADMIN_API_PORT)),
        (
            "KONG_PROXY_LISTEN",
            format!(
                "0.0.0.0:{} reuseport backlog=16384, 0.0.0.0:{} http2 ssl reuseport backlog=16384",
                PROXY_HTTP_PORT, PROXY_HTTPS_PORT
            ),
        ),
        ("KONG_STATUS_LISTEN", format!("0.0.0.0:{}", STATUS_PORT)),
        ("KONG_DATABASE", "off".to_string()),
        ("KONG_ADMIN_SSL_CERT", cert(SECRET_TLS_CERT_KEY)),
        ("KONG_ADMIN_SSL_CERT_KEY", cert(SECRET_TLS_KEY_KEY)),
        ("KONG_NGINX_ADMIN_SSL_CLIENT_CERTIFICATE", cert(SECRET_CA_CERT_KEY)),
        ("KONG_NGINX_ADMIN_SSL_VERIFY_CLIENT", "on".to_string()),
    ];
    for (name, value) in defaults {
        set_env_default(container, name, &value);
    }
}

/// Fill fields the API server defaults so that a stored Deployment compares
/// equal to a freshly generated one
fn apply_server_defaults(deployment: &mut Deployment) {
    let spec = pod_spec_mut(deployment);
    for container in spec.containers.iter_mut() {
        if container.image_pull_policy.is_none() {
            let latest = container
                .image
                .as_deref()
                .map(|image| !image.contains(':') || image.ends_with(":latest"))
                .unwrap_or(true);
            container.image_pull_policy = Some(if latest { "Always" } else { "IfNotPresent" }.to_string());
        }
        container
            .termination_message_path
            .get_or_insert_with(|| "/dev/termination-log".to_string());
        container
            .termination_message_policy
            .get_or_insert_with(|| "File".to_string());
        container.resources.get_or_insert_with(Default::default);
    }
    for volume in spec.volumes.iter_mut().flatten() {
        if let Some(secret) = volume.secret.as_mut() {
            secret.default_mode.get_or_insert(DEFAULT_VOLUME_MODE);
        }
        if let Some(config_map) = volume.config_map.as_mut() {
            config_map.default_mode.get_or_insert(DEFAULT_VOLUME_MODE);
        }
    }
}

/// Replica count to write
///
/// With horizontal scaling the autoscaler owns the count; only the floor is
/// enforced here so a scale-up does not wait for the autoscaler.
pub fn desired_replicas(dataplane: &DataPlane, existing: Option<&Deployment>, explicit: Option<i32>) -> i32 {
    if let Some(replicas) = explicit {
        return replicas;
    }

    match dataplane.horizontal_scaling() {
        Some(hpa) => {
            let min = hpa.min_replicas.unwrap_or(1);
            existing
                .and_then(|d| d.spec.as_ref())
                .and_then(|s| s.replicas)
                .map_or(min, |current| current.max(min))
        }
        None => dataplane.desired_replicas(),
    }
}

fn run_before_callbacks(callbacks: &[BeforeCallback], dataplane: &DataPlane) -> Result<(), ReconcileError> {
    let errors: Vec<String> = callbacks.iter().filter_map(|cb| cb(dataplane).err()).collect();
    if errors.is_empty() {
        Ok(())
    } else {
        Err(ReconcileError::Callbacks(errors))
    }
}

fn run_after_callbacks(
    callbacks: &[AfterCallback],
    plugins: &[PluginMount],
    dataplane: &DataPlane,
    deployment: &mut Deployment,
) -> Result<(), ReconcileError> {
    let mut errors = Vec::new();
    if let Err(e) = mount_plugins(deployment, plugins) {
        errors.push(e);
    }
    for callback in callbacks {
        if let Err(e) = callback(dataplane, deployment) {
            errors.push(e);
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ReconcileError::Callbacks(errors))
    }
}

/// Build the full desired Deployment for a cohort
pub fn build_deployment(
    ctx: &Context,
    dataplane: &DataPlane,
    request: &DeploymentRequest<'_>,
    existing: Option<&Deployment>,
) -> Result<Deployment, ReconcileError> {
    let user_template = dataplane.spec.deployment.pod_template_spec.as_ref();
    let image = resolve_image(user_template, &ctx.config);
    if ctx.config.validate_images {
        validate_image(&image)?;
    }

    let mut deployment = generate_deployment(dataplane, request.state, request.token, &image);
    inject_cluster_certificate(&mut deployment, request.cert_secret);
    run_after_callbacks(&ctx.callbacks.after, request.plugins, dataplane, &mut deployment)?;

    if let Some(template) = user_template {
        if let Some(spec) = deployment.spec.as_mut() {
            apply_pod_template_overrides(&mut spec.template, template).map_err(ReconcileError::PodTemplate)?;
            // Pods must keep matching the immutable selector
            let labels = spec
                .template
                .metadata
                .get_or_insert_with(Default::default)
                .labels
                .get_or_insert_with(Default::default);
            labels.extend(selector_labels(&dataplane.name_any(), request.token));
        }
    }

    apply_env_defaults(&mut deployment);
    apply_server_defaults(&mut deployment);

    if let Some(spec) = deployment.spec.as_mut() {
        spec.replicas = Some(desired_replicas(dataplane, existing, request.replicas));
    }
    Ok(deployment)
}

/// Selector token a Deployment was created with
pub fn deployment_selector_token(deployment: &Deployment) -> Option<&str> {
    deployment
        .spec
        .as_ref()
        .and_then(|s| s.selector.match_labels.as_ref())
        .and_then(|labels| labels.get(SELECTOR_LABEL))
        .map(String::as_str)
}

/// True if the fields this builder manages differ between the two
pub fn deployment_differs(existing: &Deployment, desired: &Deployment) -> bool {
    let empty = Default::default();
    if !contains_all(
        existing.metadata.labels.as_ref(),
        desired.metadata.labels.as_ref().unwrap_or(&empty),
    ) {
        return true;
    }

    let (Some(have), Some(want)) = (existing.spec.as_ref(), desired.spec.as_ref()) else {
        return true;
    };
    if have.replicas != want.replicas || have.strategy != want.strategy {
        return true;
    }

    let have_meta = have.template.metadata.as_ref();
    let want_meta = want.template.metadata.as_ref();
    if !contains_all(
        have_meta.and_then(|m| m.labels.as_ref()),
        want_meta.and_then(|m| m.labels.as_ref()).unwrap_or(&empty),
    ) || !contains_all(
        have_meta.and_then(|m| m.annotations.as_ref()),
        want_meta.and_then(|m| m.annotations.as_ref()).unwrap_or(&empty),
    ) {
        return true;
    }

    let default_pod = PodSpec::default();
    let have_pod = have.template.spec.as_ref().unwrap_or(&default_pod);
    let want_pod = want.template.spec.as_ref().unwrap_or(&default_pod);

    have_pod.containers != want_pod.containers
        || have_pod.volumes != want_pod.volumes
        || have_pod.affinity != want_pod.affinity
        || pod_fields_differ(have_pod, want_pod)
}

/// True if any other pod field set in `want` holds a different value in
/// `have`; fields only the server filled in are ignored
fn pod_fields_differ(have: &PodSpec, want: &PodSpec) -> bool {
    let (Ok(Value::Object(have)), Ok(Value::Object(want))) = (serde_json::to_value(have), serde_json::to_value(want))
    else {
        return true;
    };
    want.iter()
        .filter(|(field, _)| !matches!(field.as_str(), "containers" | "volumes" | "affinity"))
        .any(|(field, value)| have.get(field) != Some(value))
}

/// The existing Deployment with the managed fields taken from `desired`
fn merge_deployment(existing: &Deployment, desired: &Deployment) -> Deployment {
    let mut updated = existing.clone();
    if let Some(labels) = desired.metadata.labels.as_ref() {
        updated
            .metadata
            .labels
            .get_or_insert_with(Default::default)
            .extend(labels.clone());
    }

    if let (Some(spec), Some(want)) = (updated.spec.as_mut(), desired.spec.as_ref()) {
        spec.replicas = want.replicas;
        spec.strategy = want.strategy.clone();
        spec.template = want.template.clone();
    }
    updated
}

/// Ensure the cohort's proxy Deployment
///
/// A Deployment whose selector token no longer matches is deleted, since
/// the selector is immutable; the next pass recreates it.
pub async fn ensure_deployment(
    ctx: &Context,
    dataplane: &DataPlane,
    request: DeploymentRequest<'_>,
) -> Result<(EnsureResult, Option<Deployment>), ReconcileError> {
    run_before_callbacks(&ctx.callbacks.before, dataplane)?;

    let name = dataplane.name_any();
    let store = ctx.store.as_ref();
    let labels = ChildLabels::new(&name, request.state).to_map();

    let mut existing = list_for_owner::<Deployment>(store, dataplane, &labels).await?;
    if existing.len() > 1 {
        let count = reduce_to_one(store, ctx.pre_delete.as_ref(), existing, None).await?;
        return Err(ReconcileError::Reduced {
            kind: OwnedKind::Deployment,
            state: request.state,
            dataplane: name,
            count,
        });
    }
    let current = existing.pop();

    let desired = build_deployment(ctx, dataplane, &request, current.as_ref())?;

    let Some(current) = current else {
        let created = create_child(store, desired).await?;
        info!(
            dataplane = ?name,
            deployment = ?created.name_any(),
            state = request.state.as_str(),
            "Created Deployment"
        );
        return Ok((EnsureResult::Created, Some(created)));
    };

    if deployment_selector_token(&current) != Some(request.token) {
        info!(
            dataplane = ?name,
            deployment = ?current.name_any(),
            have = ?deployment_selector_token(&current),
            want = ?request.token,
            "Deployment selector changed, deleting for recreation"
        );
        delete_owned(store, ctx.pre_delete.as_ref(), current).await?;
        return Ok((EnsureResult::Deleted, None));
    }

    if !deployment_differs(&current, &desired) {
        debug!(dataplane = ?name, deployment = ?current.name_any(), "Deployment up to date");
        return Ok((EnsureResult::Noop, Some(current)));
    }

    let replaced = replace_child(store, merge_deployment(&current, &desired)).await?;
    info!(
        dataplane = ?name,
        deployment = ?replaced.name_any(),
        state = request.state.as_str(),
        replicas = ?replaced.spec.as_ref().and_then(|s| s.replicas),
        "Updated Deployment"
    );
    Ok((EnsureResult::Updated, Some(replaced)))
}

/// Delete every Deployment of a cohort; returns how many were deleted
pub async fn delete_deployments(
    ctx: &Context,
    dataplane: &DataPlane,
    state: CohortState,
) -> Result<usize, ReconcileError> {
    let name = dataplane.name_any();
    let store = ctx.store.as_ref();
    let existing =
        list_for_owner::<Deployment>(store, dataplane, &ChildLabels::new(&name, state).to_map()).await?;

    let count = existing.len();
    for deployment in existing {
        info!(dataplane = ?name, deployment = ?deployment.name_any(), state = state.as_str(), "Deleting Deployment");
        delete_owned(store, ctx.pre_delete.as_ref(), deployment).await?;
    }
    Ok(count)
}

/// True once every desired replica of `deployment` is ready
pub fn all_replicas_ready(deployment: &Deployment) -> bool {
    let desired = deployment.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
    let ready = deployment
        .status
        .as_ref()
        .and_then(|s| s.ready_replicas)
        .unwrap_or(0);
    desired > 0 && ready >= desired
}

#[cfg(test)]
#[path = "deployment_test.rs"]
mod tests;
