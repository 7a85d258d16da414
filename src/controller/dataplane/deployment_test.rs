#![allow(clippy::unwrap_used)]

use super::*;
use crate::controller::clock::MockClock;
use crate::controller::store_mock::MockStore;
use k8s_openapi::api::apps::v1::DeploymentStatus;
use k8s_openapi::api::core::v1::EnvVar;
use std::sync::Arc;

fn setup(spec_yaml: &str) -> (Arc<MockStore>, Context, DataPlane) {
    let yaml = format!(
        "apiVersion: gateway-operator.dev/v1beta1\nkind: DataPlane\nmetadata:\n  name: edge\n  namespace: default\nspec:\n{}",
        spec_yaml
    );
    let store = Arc::new(MockStore::new());
    let dataplane = store.insert_dataplane(serde_yaml::from_str(&yaml).unwrap());
    let clock = Arc::new(MockClock::new(chrono::Utc::now()));
    let ctx = Context::new_mock(store.clone(), clock);
    (store, ctx, dataplane)
}

fn request<'a>(token: &'a str, plugins: &'a [PluginMount]) -> DeploymentRequest<'a> {
    DeploymentRequest {
        state: CohortState::Live,
        token,
        cert_secret: "dataplane-admin-mtls-edge-00001",
        plugins,
        replicas: None,
    }
}

fn proxy(deployment: &Deployment) -> &Container {
    deployment
        .spec
        .as_ref()
        .unwrap()
        .template
        .spec
        .as_ref()
        .unwrap()
        .containers
        .iter()
        .find(|c| c.name == PROXY_CONTAINER_NAME)
        .unwrap()
}

fn env_value<'a>(container: &'a Container, name: &str) -> Option<&'a str> {
    container
        .env
        .as_ref()
        .unwrap()
        .iter()
        .find(|e| e.name == name)
        .and_then(|e| e.value.as_deref())
}

#[test]
fn test_build_generates_proxy_with_certificate_and_defaults() {
    let (_store, ctx, dataplane) = setup("  deployment: {}\n");

    let deployment = build_deployment(&ctx, &dataplane, &request("tok", &[]), None).unwrap();
    let spec = deployment.spec.as_ref().unwrap();
    let container = proxy(&deployment);

    assert_eq!(spec.replicas, Some(1));
    assert_eq!(spec.selector.match_labels.as_ref(), Some(&selector_labels("edge", "tok")));
    assert_eq!(
        spec.template.metadata.as_ref().unwrap().labels.as_ref(),
        Some(&selector_labels("edge", "tok"))
    );
    assert_eq!(container.image.as_deref(), Some("kong:3.9"));
    assert_eq!(container.image_pull_policy.as_deref(), Some("IfNotPresent"));

    let volume = &spec.template.spec.as_ref().unwrap().volumes.as_ref().unwrap()[0];
    assert_eq!(volume.name, CLUSTER_CERT_VOLUME);
    assert_eq!(
        volume.secret.as_ref().unwrap().secret_name.as_deref(),
        Some("dataplane-admin-mtls-edge-00001")
    );

    assert_eq!(
        env_value(container, "KONG_CLUSTER_CERT"),
        Some("/var/cluster-certificate/tls.crt")
    );
    assert_eq!(env_value(container, "KONG_STATUS_LISTEN"), Some("0.0.0.0:8100"));
    assert_eq!(env_value(container, "KONG_DATABASE"), Some("off"));
    assert_eq!(
        env_value(container, "KONG_NGINX_ADMIN_SSL_CLIENT_CERTIFICATE"),
        Some("/var/cluster-certificate/ca.crt")
    );
}

#[test]
fn test_user_overrides_win_but_keep_selector_labels() {
    let (_store, ctx, dataplane) = setup(
        r#"  deployment:
    podTemplateSpec:
      metadata:
        labels:
          team: edge
      spec:
        containers:
        - name: proxy
          image: kong/kong-gateway:3.8
          env:
          - name: KONG_DATABASE
            value: postgres
"#,
    );

    let deployment = build_deployment(&ctx, &dataplane, &request("tok", &[]), None).unwrap();
    let container = proxy(&deployment);
    let pod_labels = deployment
        .spec
        .as_ref()
        .unwrap()
        .template
        .metadata
        .as_ref()
        .unwrap()
        .labels
        .clone()
        .unwrap();

    assert_eq!(container.image.as_deref(), Some("kong/kong-gateway:3.8"));
    assert_eq!(env_value(container, "KONG_DATABASE"), Some("postgres"));
    assert_eq!(env_value(container, "KONG_ADMIN_SSL_CERT"), Some("/var/cluster-certificate/tls.crt"));
    assert_eq!(pod_labels.get("team").map(String::as_str), Some("edge"));
    assert_eq!(pod_labels.get(SELECTOR_LABEL).map(String::as_str), Some("tok"));
}

#[test]
fn test_unsupported_image_rejected_unless_validation_disabled() {
    let (_store, mut ctx, dataplane) = setup(
        r#"  deployment:
    podTemplateSpec:
      spec:
        containers:
        - name: proxy
          image: kong:2.8
"#,
    );

    let err = build_deployment(&ctx, &dataplane, &request("tok", &[]), None).unwrap_err();
    assert!(matches!(err, ReconcileError::UnsupportedImage { .. }));

    ctx.config.validate_images = false;
    assert!(build_deployment(&ctx, &dataplane, &request("tok", &[]), None).is_ok());
}

#[test]
fn test_replicas_follow_autoscaler_floor() {
    let (_store, _ctx, dataplane) = setup(
        "  deployment:\n    replicas: 4\n    scaling:\n      horizontalScaling:\n        minReplicas: 3\n        maxReplicas: 10\n",
    );
    let with_replicas = |n: i32| Deployment {
        spec: Some(DeploymentSpec {
            replicas: Some(n),
            ..Default::default()
        }),
        ..Default::default()
    };

    assert_eq!(desired_replicas(&dataplane, None, None), 3);
    assert_eq!(desired_replicas(&dataplane, Some(&with_replicas(1)), None), 3);
    assert_eq!(desired_replicas(&dataplane, Some(&with_replicas(7)), None), 7);
    assert_eq!(desired_replicas(&dataplane, Some(&with_replicas(7)), Some(0)), 0);

    let (_store, _ctx, plain) = setup("  deployment:\n    replicas: 4\n");
    assert_eq!(desired_replicas(&plain, Some(&with_replicas(7)), None), 4);
}

#[test]
fn test_plugins_are_mounted_and_enabled() {
    let (_store, ctx, dataplane) = setup("  deployment: {}\n");
    let plugins = vec![
        PluginMount {
            name: "audit".to_string(),
            config_map: "audit".to_string(),
        },
        PluginMount {
            name: "quota".to_string(),
            config_map: "quota-src".to_string(),
        },
    ];

    let deployment = build_deployment(&ctx, &dataplane, &request("tok", &plugins), None).unwrap();
    let container = proxy(&deployment);
    let volumes = deployment.spec.as_ref().unwrap().template.spec.as_ref().unwrap().volumes.clone().unwrap();

    assert_eq!(env_value(container, "KONG_PLUGINS"), Some("bundled,audit,quota"));
    assert!(volumes.iter().any(|v| v.name == "plugin-quota"
        && v.config_map.as_ref().map(|c| c.name.as_str()) == Some("quota-src")));
    assert!(container
        .volume_mounts
        .as_ref()
        .unwrap()
        .iter()
        .any(|m| m.mount_path == "/opt/kong/plugins/audit"));
}

#[test]
fn test_after_callback_failures_are_collected() {
    let (_store, mut ctx, dataplane) = setup("  deployment: {}\n");
    ctx.callbacks
        .after
        .push(Box::new(|_: &DataPlane, _: &mut Deployment| Err("first".to_string())));
    ctx.callbacks.after.push(Box::new(|_: &DataPlane, d: &mut Deployment| {
        let container = pod_spec_mut(d).containers.first_mut().unwrap();
        container.env.get_or_insert_with(Vec::new).push(EnvVar {
            name: "TOUCHED".to_string(),
            value: Some("1".to_string()),
            value_from: None,
        });
        Err("second".to_string())
    }));

    let err = build_deployment(&ctx, &dataplane, &request("tok", &[]), None).unwrap_err();
    match err {
        ReconcileError::Callbacks(errors) => assert_eq!(errors, vec!["first", "second"]),
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn test_before_callback_failure_creates_nothing() {
    let (store, mut ctx, dataplane) = setup("  deployment: {}\n");
    ctx.callbacks.before.push(|_| Err("not yet".to_string()));

    let result = ensure_deployment(&ctx, &dataplane, request("tok", &[])).await;

    assert!(matches!(result, Err(ReconcileError::Callbacks(_))));
    assert!(store.list::<Deployment>().is_empty());
}

#[tokio::test]
async fn test_ensure_deployment_is_idempotent() {
    let (store, ctx, dataplane) = setup("  deployment: {}\n");

    let (first, created) = ensure_deployment(&ctx, &dataplane, request("tok", &[])).await.unwrap();
    let (second, current) = ensure_deployment(&ctx, &dataplane, request("tok", &[])).await.unwrap();

    assert_eq!(first, EnsureResult::Created);
    assert_eq!(second, EnsureResult::Noop);
    assert_eq!(created.unwrap().name_any(), current.unwrap().name_any());
    assert_eq!(store.list::<Deployment>().len(), 1);
}

#[tokio::test]
async fn test_ensure_deployment_updates_on_spec_change() {
    let (store, ctx, dataplane) = setup("  deployment: {}\n");
    ensure_deployment(&ctx, &dataplane, request("tok", &[])).await.unwrap();

    store.update_dataplane_spec("default", "edge", |spec| spec.deployment.replicas = Some(3));
    let dataplane = store.dataplane("default", "edge");
    let (result, updated) = ensure_deployment(&ctx, &dataplane, request("tok", &[])).await.unwrap();

    assert_eq!(result, EnsureResult::Updated);
    assert_eq!(updated.unwrap().spec.unwrap().replicas, Some(3));
}

#[tokio::test]
async fn test_ensure_deployment_updates_on_pod_field_override() {
    let (store, ctx, dataplane) = setup("  deployment: {}\n");
    ensure_deployment(&ctx, &dataplane, request("tok", &[])).await.unwrap();

    store.update_dataplane_spec("default", "edge", |spec| {
        spec.deployment.pod_template_spec =
            Some(serde_yaml::from_str("spec:\n  hostNetwork: true\n  dnsPolicy: ClusterFirstWithHostNet\n").unwrap());
    });
    let dataplane = store.dataplane("default", "edge");
    let (result, updated) = ensure_deployment(&ctx, &dataplane, request("tok", &[])).await.unwrap();

    assert_eq!(result, EnsureResult::Updated);
    let pod = updated.unwrap().spec.unwrap().template.spec.unwrap();
    assert_eq!(pod.host_network, Some(true));
    assert_eq!(pod.dns_policy.as_deref(), Some("ClusterFirstWithHostNet"));

    let (result, _) = ensure_deployment(&ctx, &dataplane, request("tok", &[])).await.unwrap();
    assert_eq!(result, EnsureResult::Noop);
}

#[tokio::test]
async fn test_selector_mismatch_deletes_for_recreation() {
    let (store, ctx, dataplane) = setup("  deployment: {}\n");
    ensure_deployment(&ctx, &dataplane, request("old", &[])).await.unwrap();

    let (result, deployment) = ensure_deployment(&ctx, &dataplane, request("new", &[])).await.unwrap();
    assert_eq!(result, EnsureResult::Deleted);
    assert!(deployment.is_none());
    assert!(store.list::<Deployment>().is_empty());

    let (result, _) = ensure_deployment(&ctx, &dataplane, request("new", &[])).await.unwrap();
    assert_eq!(result, EnsureResult::Created);
}

#[tokio::test]
async fn test_duplicate_deployments_reduced_to_one() {
    let (store, ctx, dataplane) = setup("  deployment: {}\n");
    let generated = generate_deployment(&dataplane, CohortState::Live, "tok", "kong:3.9");
    store.insert_object(generated.clone());
    let newest = store.insert_object(generated);

    let err = ensure_deployment(&ctx, &dataplane, request("tok", &[])).await.unwrap_err();

    assert!(matches!(err, ReconcileError::Reduced { count: 1, .. }));
    let remaining = store.list::<Deployment>();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].name_any(), newest.name_any());
}

#[test]
fn test_all_replicas_ready() {
    let deployment = |desired: i32, ready: i32| Deployment {
        spec: Some(DeploymentSpec {
            replicas: Some(desired),
            ..Default::default()
        }),
        status: Some(DeploymentStatus {
            ready_replicas: Some(ready),
            ..Default::default()
        }),
        ..Default::default()
    };

    assert!(all_replicas_ready(&deployment(2, 2)));
    assert!(!all_replicas_ready(&deployment(2, 1)));
    assert!(!all_replicas_ready(&deployment(0, 0)));
}
