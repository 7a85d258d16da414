//! Collaborator seams around the DataPlane reconciler
//!
//! - `ExtensionProcessor` rewrites the spec before the workload is generated
//! - `PluginResolver` turns plugin references into config map mounts
//! - `PreDeleteHook` runs right before any owned child is deleted
//!
//! Each has a default used by the operator binary; tests swap in their own.

use crate::controller::labels::WAIT_FOR_OWNER_FINALIZER;
use crate::controller::owned::OwnedObject;
use crate::controller::store::{ClusterStore, StoreError};
use crate::crd::DataPlane;
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum ExtensionError {
    /// Misconfiguration the user can fix; stops the pass without failing it
    #[error("extension not ready: {0}")]
    Extension(String),

    #[error("applying extensions failed: {0}")]
    Other(String),
}

/// Whether reconciliation continues after extensions ran
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExtensionOutcome {
    Continue,
    Stop,
}

/// Applies `spec.extensions` to an in-memory copy of the DataPlane
#[async_trait]
pub trait ExtensionProcessor: Send + Sync {
    async fn apply(&self, dataplane: &mut DataPlane) -> Result<ExtensionOutcome, ExtensionError>;
}

/// Leaves the DataPlane untouched
pub struct NoOpExtensions;

#[async_trait]
impl ExtensionProcessor for NoOpExtensions {
    async fn apply(&self, dataplane: &mut DataPlane) -> Result<ExtensionOutcome, ExtensionError> {
        if !dataplane.spec.extensions.is_empty() {
            debug!(
                extensions = dataplane.spec.extensions.len(),
                "No extension processor configured, ignoring extension references"
            );
        }
        Ok(ExtensionOutcome::Continue)
    }
}

/// A plugin bundle to mount into the proxy container
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PluginMount {
    /// Plugin name, as listed in `KONG_PLUGINS`
    pub name: String,
    /// ConfigMap holding the plugin sources
    pub config_map: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PluginResolution {
    Ready(Vec<PluginMount>),
    /// A referenced plugin is not available yet
    Requeue(Duration),
}

#[async_trait]
pub trait PluginResolver: Send + Sync {
    async fn resolve(
        &self,
        store: &dyn ClusterStore,
        dataplane: &DataPlane,
    ) -> Result<PluginResolution, ExtensionError>;
}

/// How long to wait for a referenced plugin ConfigMap to appear
pub const PLUGIN_REQUEUE: Duration = Duration::from_secs(5);

/// Maps every plugin reference to a ConfigMap of the same name
///
/// References into other namespaces are rejected: the ConfigMap is mounted
/// as a volume and must live next to the proxy pods. Until every referenced
/// ConfigMap exists the resolution asks for a requeue.
pub struct ConfigMapPlugins;

#[async_trait]
impl PluginResolver for ConfigMapPlugins {
    async fn resolve(
        &self,
        store: &dyn ClusterStore,
        dataplane: &DataPlane,
    ) -> Result<PluginResolution, ExtensionError> {
        let namespace = dataplane.metadata.namespace.as_deref();
        let mut mounts = Vec::with_capacity(dataplane.spec.plugins_to_install.len());

        for plugin in &dataplane.spec.plugins_to_install {
            if plugin.namespace.is_some() && plugin.namespace.as_deref() != namespace {
                return Err(ExtensionError::Extension(format!(
                    "plugin {} must be in namespace {}",
                    plugin.name,
                    namespace.unwrap_or_default()
                )));
            }

            let found = store
                .get_config_map(namespace.unwrap_or_default(), &plugin.name)
                .await
                .map_err(|e| ExtensionError::Other(e.to_string()))?;
            if found.is_none() {
                debug!(plugin = ?plugin.name, "Plugin ConfigMap not found yet");
                return Ok(PluginResolution::Requeue(PLUGIN_REQUEUE));
            }

            mounts.push(PluginMount {
                name: plugin.name.clone(),
                config_map: plugin.name.clone(),
            });
        }

        Ok(PluginResolution::Ready(mounts))
    }
}

/// Runs immediately before an owned child is deleted
#[async_trait]
pub trait PreDeleteHook: Send + Sync {
    async fn before_delete(&self, store: &dyn ClusterStore, object: &OwnedObject) -> Result<(), StoreError>;
}

/// Releases the wait-for-owner finalizer so the delete goes through
pub struct StripFinalizerHook;

#[async_trait]
impl PreDeleteHook for StripFinalizerHook {
    async fn before_delete(&self, store: &dyn ClusterStore, object: &OwnedObject) -> Result<(), StoreError> {
        let mut object = object.clone();
        if !object.remove_finalizer(WAIT_FOR_OWNER_FINALIZER) {
            return Ok(());
        }

        info!(
            kind = %object.kind(),
            name = ?object.name(),
            "Removing wait-for-owner finalizer"
        );
        match store.replace_owned(object).await {
            Ok(_) | Err(StoreError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::store_mock::MockStore;
    use crate::crd::dataplane::PluginRef;
    use crate::crd::DataPlaneSpec;
    use k8s_openapi::api::core::v1::Service;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn dataplane_with_plugins(plugins: Vec<PluginRef>) -> DataPlane {
        let mut dataplane = DataPlane::new(
            "edge",
            DataPlaneSpec {
                plugins_to_install: plugins,
                ..Default::default()
            },
        );
        dataplane.metadata.namespace = Some("default".to_string());
        dataplane
    }

    #[tokio::test]
    async fn test_config_map_plugins_maps_each_reference() {
        let store = MockStore::new();
        store.insert_config_map("default", "rate-limit-pro");
        store.insert_config_map("default", "audit");
        let dataplane = dataplane_with_plugins(vec![
            PluginRef {
                name: "rate-limit-pro".to_string(),
                namespace: None,
            },
            PluginRef {
                name: "audit".to_string(),
                namespace: Some("default".to_string()),
            },
        ]);

        let resolution = ConfigMapPlugins.resolve(&store, &dataplane).await.unwrap();
        assert_eq!(
            resolution,
            PluginResolution::Ready(vec![
                PluginMount {
                    name: "rate-limit-pro".to_string(),
                    config_map: "rate-limit-pro".to_string()
                },
                PluginMount {
                    name: "audit".to_string(),
                    config_map: "audit".to_string()
                },
            ])
        );
    }

    #[tokio::test]
    async fn test_config_map_plugins_rejects_foreign_namespace() {
        let dataplane = dataplane_with_plugins(vec![PluginRef {
            name: "audit".to_string(),
            namespace: Some("other".to_string()),
        }]);

        let result = ConfigMapPlugins.resolve(&MockStore::new(), &dataplane).await;
        assert!(matches!(result, Err(ExtensionError::Extension(_))));
    }

    #[tokio::test]
    async fn test_config_map_plugins_requeue_until_config_map_exists() {
        let store = MockStore::new();
        store.insert_config_map("default", "audit");
        let dataplane = dataplane_with_plugins(vec![
            PluginRef {
                name: "audit".to_string(),
                namespace: None,
            },
            PluginRef {
                name: "quota".to_string(),
                namespace: None,
            },
        ]);

        let resolution = ConfigMapPlugins.resolve(&store, &dataplane).await.unwrap();
        assert_eq!(resolution, PluginResolution::Requeue(PLUGIN_REQUEUE));

        store.insert_config_map("default", "quota");
        let resolution = ConfigMapPlugins.resolve(&store, &dataplane).await.unwrap();
        assert!(matches!(resolution, PluginResolution::Ready(mounts) if mounts.len() == 2));
    }

    #[tokio::test]
    async fn test_strip_finalizer_hook_unblocks_delete() {
        let store = MockStore::new();
        let svc = store.insert_object(Service {
            metadata: ObjectMeta {
                name: Some("admin".to_string()),
                finalizers: Some(vec![WAIT_FOR_OWNER_FINALIZER.to_string()]),
                ..Default::default()
            },
            ..Default::default()
        });
        let object = OwnedObject::Service(svc);

        StripFinalizerHook.before_delete(&store, &object).await.unwrap();
        store
            .delete_owned(object.kind(), "default", "admin")
            .await
            .unwrap();

        assert!(store.list::<Service>().is_empty());
    }
}
