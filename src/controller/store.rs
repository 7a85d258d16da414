//! Cluster access for the reconcilers
//!
//! Reconcilers only talk to the API server through `ClusterStore`, so the
//! whole reconcile loop can be driven against the in-memory `MockStore` in
//! tests.

use crate::controller::owned::{OwnedKind, OwnedObject, OwnedResource};
use crate::crd::{DataPlane, DataPlaneStatus};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::autoscaling::v2::HorizontalPodAutoscaler;
use k8s_openapi::api::core::v1::{ConfigMap, Secret, Service};
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::ResourceExt;
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("conflict writing {0}")]
    Conflict(String),

    #[error("Kubernetes API error: {0}")]
    Kube(#[source] kube::Error),

    #[error("store returned a different kind than {0}")]
    UnexpectedKind(OwnedKind),
}

impl StoreError {
    /// Classify an API error, naming the object it concerns
    pub fn from_kube(err: kube::Error, what: impl Into<String>) -> Self {
        match err {
            kube::Error::Api(ae) if ae.code == 404 => StoreError::NotFound(what.into()),
            kube::Error::Api(ae) if ae.code == 409 => StoreError::Conflict(what.into()),
            other => StoreError::Kube(other),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict(_))
    }
}

/// Read and write access to DataPlanes and their children
#[async_trait]
pub trait ClusterStore: Send + Sync {
    async fn get_dataplane(&self, namespace: &str, name: &str) -> Result<DataPlane, StoreError>;

    /// Replace the status of `dataplane`; conditional on its resourceVersion
    async fn patch_dataplane_status(
        &self,
        dataplane: &DataPlane,
        status: &DataPlaneStatus,
    ) -> Result<DataPlane, StoreError>;

    async fn remove_dataplane_annotation(
        &self,
        dataplane: &DataPlane,
        key: &str,
    ) -> Result<(), StoreError>;

    /// List objects of `kind` in `namespace` carrying all of `labels`
    async fn list_owned(
        &self,
        kind: OwnedKind,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<OwnedObject>, StoreError>;

    async fn create_owned(&self, object: OwnedObject) -> Result<OwnedObject, StoreError>;

    /// Replace an object; conditional on its resourceVersion
    async fn replace_owned(&self, object: OwnedObject) -> Result<OwnedObject, StoreError>;

    async fn delete_owned(&self, kind: OwnedKind, namespace: &str, name: &str) -> Result<(), StoreError>;

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, StoreError>;

    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<Option<ConfigMap>, StoreError>;
}

/// `ClusterStore` backed by the Kubernetes API
#[derive(Clone)]
pub struct KubeStore {
    client: kube::Client,
}

impl KubeStore {
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }

    fn api<K: OwnedResource>(&self, namespace: &str) -> Api<K> {
        Api::namespaced(self.client.clone(), namespace)
    }

    async fn list_typed<K: OwnedResource>(
        &self,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<OwnedObject>, StoreError> {
        let list = self
            .api::<K>(namespace)
            .list(&ListParams::default().labels(selector))
            .await
            .map_err(|e| StoreError::from_kube(e, K::KIND.as_str()))?;
        Ok(list.items.into_iter().map(K::into_object).collect())
    }

    async fn create_typed<K: OwnedResource>(&self, object: K) -> Result<OwnedObject, StoreError> {
        let namespace = object.namespace().unwrap_or_default();
        let what = format!("{} {}/{}", K::KIND, namespace, object.name_any());
        self.api::<K>(&namespace)
            .create(&PostParams::default(), &object)
            .await
            .map(K::into_object)
            .map_err(|e| StoreError::from_kube(e, what))
    }

    async fn replace_typed<K: OwnedResource>(&self, object: K) -> Result<OwnedObject, StoreError> {
        let namespace = object.namespace().unwrap_or_default();
        let name = object.name_any();
        let what = format!("{} {}/{}", K::KIND, namespace, name);
        self.api::<K>(&namespace)
            .replace(&name, &PostParams::default(), &object)
            .await
            .map(K::into_object)
            .map_err(|e| StoreError::from_kube(e, what))
    }

    async fn delete_typed<K: OwnedResource>(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        self.api::<K>(namespace)
            .delete(name, &DeleteParams::background())
            .await
            .map(|_| ())
            .map_err(|e| StoreError::from_kube(e, format!("{} {}/{}", K::KIND, namespace, name)))
    }
}

/// Render labels as an equality-based selector
pub fn label_selector(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

#[async_trait]
impl ClusterStore for KubeStore {
    async fn get_dataplane(&self, namespace: &str, name: &str) -> Result<DataPlane, StoreError> {
        let api: Api<DataPlane> = Api::namespaced(self.client.clone(), namespace);
        api.get(name)
            .await
            .map_err(|e| StoreError::from_kube(e, format!("DataPlane {}/{}", namespace, name)))
    }

    async fn patch_dataplane_status(
        &self,
        dataplane: &DataPlane,
        status: &DataPlaneStatus,
    ) -> Result<DataPlane, StoreError> {
        let namespace = dataplane.namespace().unwrap_or_default();
        let name = dataplane.name_any();
        let api: Api<DataPlane> = Api::namespaced(self.client.clone(), &namespace);

        // resourceVersion in the body turns the patch into a conditional write
        let patch = serde_json::json!({
            "metadata": { "resourceVersion": dataplane.resource_version() },
            "status": status,
        });

        api.patch_status(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| StoreError::from_kube(e, format!("DataPlane {}/{} status", namespace, name)))
    }

    async fn remove_dataplane_annotation(
        &self,
        dataplane: &DataPlane,
        key: &str,
    ) -> Result<(), StoreError> {
        let namespace = dataplane.namespace().unwrap_or_default();
        let name = dataplane.name_any();
        let api: Api<DataPlane> = Api::namespaced(self.client.clone(), &namespace);

        let patch = serde_json::json!({
            "metadata": { "annotations": { key: serde_json::Value::Null } }
        });

        api.patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map(|_| ())
            .map_err(|e| StoreError::from_kube(e, format!("DataPlane {}/{}", namespace, name)))
    }

    async fn list_owned(
        &self,
        kind: OwnedKind,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<OwnedObject>, StoreError> {
        let selector = label_selector(labels);
        match kind {
            OwnedKind::Deployment => self.list_typed::<Deployment>(namespace, &selector).await,
            OwnedKind::Service => self.list_typed::<Service>(namespace, &selector).await,
            OwnedKind::Secret => self.list_typed::<Secret>(namespace, &selector).await,
            OwnedKind::HorizontalPodAutoscaler => {
                self.list_typed::<HorizontalPodAutoscaler>(namespace, &selector)
                    .await
            }
            OwnedKind::PodDisruptionBudget => {
                self.list_typed::<PodDisruptionBudget>(namespace, &selector)
                    .await
            }
        }
    }

    async fn create_owned(&self, object: OwnedObject) -> Result<OwnedObject, StoreError> {
        match object {
            OwnedObject::Deployment(o) => self.create_typed(o).await,
            OwnedObject::Service(o) => self.create_typed(o).await,
            OwnedObject::Secret(o) => self.create_typed(o).await,
            OwnedObject::HorizontalPodAutoscaler(o) => self.create_typed(o).await,
            OwnedObject::PodDisruptionBudget(o) => self.create_typed(o).await,
        }
    }

    async fn replace_owned(&self, object: OwnedObject) -> Result<OwnedObject, StoreError> {
        match object {
            OwnedObject::Deployment(o) => self.replace_typed(o).await,
            OwnedObject::Service(o) => self.replace_typed(o).await,
            OwnedObject::Secret(o) => self.replace_typed(o).await,
            OwnedObject::HorizontalPodAutoscaler(o) => self.replace_typed(o).await,
            OwnedObject::PodDisruptionBudget(o) => self.replace_typed(o).await,
        }
    }

    async fn delete_owned(&self, kind: OwnedKind, namespace: &str, name: &str) -> Result<(), StoreError> {
        match kind {
            OwnedKind::Deployment => self.delete_typed::<Deployment>(namespace, name).await,
            OwnedKind::Service => self.delete_typed::<Service>(namespace, name).await,
            OwnedKind::Secret => self.delete_typed::<Secret>(namespace, name).await,
            OwnedKind::HorizontalPodAutoscaler => {
                self.delete_typed::<HorizontalPodAutoscaler>(namespace, name)
                    .await
            }
            OwnedKind::PodDisruptionBudget => {
                self.delete_typed::<PodDisruptionBudget>(namespace, name)
                    .await
            }
        }
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, StoreError> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        api.get_opt(name)
            .await
            .map_err(|e| StoreError::from_kube(e, format!("Secret {}/{}", namespace, name)))
    }

    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<Option<ConfigMap>, StoreError> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        api.get_opt(name)
            .await
            .map_err(|e| StoreError::from_kube(e, format!("ConfigMap {}/{}", namespace, name)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_selector_is_sorted_and_comma_separated() {
        let labels = BTreeMap::from([
            ("b".to_string(), "2".to_string()),
            ("a".to_string(), "1".to_string()),
        ]);
        assert_eq!(label_selector(&labels), "a=1,b=2");
        assert_eq!(label_selector(&BTreeMap::new()), "");
    }

    #[test]
    fn test_store_error_predicates() {
        assert!(StoreError::NotFound("x".into()).is_not_found());
        assert!(StoreError::Conflict("x".into()).is_conflict());
        assert!(!StoreError::Conflict("x".into()).is_not_found());
    }
}
