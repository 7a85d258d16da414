//! In-memory `ClusterStore` for tests
//!
//! Mimics the API server behaviour the reconcilers depend on:
//! resourceVersion preconditions, generateName, creation timestamps,
//! cluster IP assignment, status subresources that `replace` leaves alone,
//! and deletion held back by finalizers.

#![allow(clippy::expect_used)]

use crate::controller::labels::contains_all;
use crate::controller::owned::{OwnedKind, OwnedObject, OwnedResource};
use crate::controller::store::{ClusterStore, StoreError};
use crate::crd::{DataPlane, DataPlaneSpec, DataPlaneStatus};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::ResourceExt;
use std::collections::BTreeMap;
use std::sync::Mutex;

/// 2026-01-01T00:00:00Z
const EPOCH: i64 = 1_767_225_600;

#[derive(Default)]
struct State {
    dataplanes: BTreeMap<(String, String), DataPlane>,
    objects: Vec<OwnedObject>,
    counter: u64,
    next_cluster_ip: u8,
    conflict_next_status_patch: bool,
    config_maps: BTreeMap<(String, String), ConfigMap>,
    failures: Vec<FailPoint>,
}

impl State {
    /// Consume a pending failure for `point`, if one was armed
    fn take_failure(&mut self, point: FailPoint) -> Result<(), StoreError> {
        match self.failures.iter().position(|p| *p == point) {
            Some(idx) => {
                self.failures.remove(idx);
                Err(StoreError::Kube(kube::Error::Service(
                    format!("injected {:?} failure", point).into(),
                )))
            }
            None => Ok(()),
        }
    }

    fn tick(&mut self) -> u64 {
        self.counter += 1;
        self.counter
    }

    fn position(&self, kind: OwnedKind, namespace: &str, name: &str) -> Option<usize> {
        self.objects
            .iter()
            .position(|o| o.kind() == kind && o.namespace() == namespace && o.name() == name)
    }
}

fn timestamp(offset: u64) -> Time {
    let at = chrono::DateTime::from_timestamp(EPOCH + offset as i64, 0).expect("timestamp in range");
    serde_json::from_value(serde_json::json!(at.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)))
        .expect("valid Time")
}

/// Status sub-objects survive `replace`, as with the real status subresource
fn carry_status(stored: &OwnedObject, incoming: &mut OwnedObject) {
    match (stored, incoming) {
        (OwnedObject::Deployment(s), OwnedObject::Deployment(i)) => i.status = s.status.clone(),
        (OwnedObject::Service(s), OwnedObject::Service(i)) => i.status = s.status.clone(),
        (OwnedObject::HorizontalPodAutoscaler(s), OwnedObject::HorizontalPodAutoscaler(i)) => {
            i.status = s.status.clone()
        }
        (OwnedObject::PodDisruptionBudget(s), OwnedObject::PodDisruptionBudget(i)) => {
            i.status = s.status.clone()
        }
        _ => {}
    }
}

/// A write that can be made to fail once with a non-conflict API error
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailPoint {
    AnnotationRemoval,
    Replace(OwnedKind),
}

#[derive(Default)]
pub struct MockStore {
    state: Mutex<State>,
}

impl MockStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().expect("MockStore lock poisoned")
    }

    /// Store a DataPlane as if created by a user: uid, generation 1
    pub fn insert_dataplane(&self, mut dataplane: DataPlane) -> DataPlane {
        let mut state = self.lock();
        let n = state.tick();
        let meta = &mut dataplane.metadata;
        meta.namespace.get_or_insert_with(|| "default".to_string());
        meta.uid = Some(format!("uid-{}", n));
        meta.generation = Some(meta.generation.unwrap_or(1));
        meta.resource_version = Some(n.to_string());
        meta.creation_timestamp = Some(timestamp(n));

        let key = (dataplane.namespace().unwrap_or_default(), dataplane.name_any());
        state.dataplanes.insert(key, dataplane.clone());
        dataplane
    }

    pub fn dataplane(&self, namespace: &str, name: &str) -> DataPlane {
        self.lock()
            .dataplanes
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .expect("DataPlane exists")
    }

    /// Change the spec, bumping generation
    pub fn update_dataplane_spec(&self, namespace: &str, name: &str, f: impl FnOnce(&mut DataPlaneSpec)) {
        let mut state = self.lock();
        let n = state.tick();
        let dataplane = state
            .dataplanes
            .get_mut(&(namespace.to_string(), name.to_string()))
            .expect("DataPlane exists");
        f(&mut dataplane.spec);
        dataplane.metadata.generation = Some(dataplane.metadata.generation.unwrap_or(0) + 1);
        dataplane.metadata.resource_version = Some(n.to_string());
    }

    pub fn set_dataplane_annotation(&self, namespace: &str, name: &str, key: &str, value: &str) {
        let mut state = self.lock();
        let n = state.tick();
        let dataplane = state
            .dataplanes
            .get_mut(&(namespace.to_string(), name.to_string()))
            .expect("DataPlane exists");
        dataplane
            .metadata
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .insert(key.to_string(), value.to_string());
        dataplane.metadata.resource_version = Some(n.to_string());
    }

    pub fn remove_dataplane(&self, namespace: &str, name: &str) {
        self.lock()
            .dataplanes
            .remove(&(namespace.to_string(), name.to_string()));
    }

    /// Make the next status patch fail as if another writer got there first
    pub fn conflict_next_status_patch(&self) {
        self.lock().conflict_next_status_patch = true;
    }

    /// Make the next write matching `point` fail with a server error
    pub fn fail_next(&self, point: FailPoint) {
        self.lock().failures.push(point);
    }

    pub fn insert_config_map(&self, namespace: &str, name: &str) {
        let mut config_map = ConfigMap::default();
        config_map.metadata.name = Some(name.to_string());
        config_map.metadata.namespace = Some(namespace.to_string());
        self.lock()
            .config_maps
            .insert((namespace.to_string(), name.to_string()), config_map);
    }

    /// All stored objects of kind `K`, in creation order
    pub fn list<K: OwnedResource>(&self) -> Vec<K> {
        self.lock()
            .objects
            .iter()
            .filter(|o| o.kind() == K::KIND)
            .cloned()
            .filter_map(K::from_object)
            .collect()
    }

    /// Insert an object bypassing generateName/conflict handling, e.g. to
    /// simulate a duplicate left behind by a racing writer
    pub fn insert_object<K: OwnedResource>(&self, object: K) -> K {
        let mut state = self.lock();
        let n = state.tick();
        let mut object = object.into_object();
        let meta = object.meta_mut();
        if meta.name.is_none() {
            meta.name = Some(format!("{}{:05}", meta.generate_name.clone().unwrap_or_default(), n));
        }
        meta.namespace.get_or_insert_with(|| "default".to_string());
        meta.uid = Some(format!("uid-{}", n));
        meta.resource_version = Some(n.to_string());
        meta.creation_timestamp = Some(timestamp(n));
        state.objects.push(object.clone());
        K::from_object(object).expect("same kind")
    }

    /// Mutate an object the way a controller other than ours would
    /// (Deployment status, load balancer status, ...)
    pub fn update<K: OwnedResource>(&self, name: &str, f: impl FnOnce(&mut K)) {
        let mut state = self.lock();
        let n = state.tick();
        let object = state
            .objects
            .iter_mut()
            .find(|o| o.kind() == K::KIND && o.name() == name)
            .expect("object exists");
        let mut typed = K::from_object(object.clone()).expect("same kind");
        f(&mut typed);
        typed.meta_mut().resource_version = Some(n.to_string());
        *object = typed.into_object();
    }
}

#[async_trait]
impl ClusterStore for MockStore {
    async fn get_dataplane(&self, namespace: &str, name: &str) -> Result<DataPlane, StoreError> {
        self.lock()
            .dataplanes
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("DataPlane {}/{}", namespace, name)))
    }

    async fn patch_dataplane_status(
        &self,
        dataplane: &DataPlane,
        status: &DataPlaneStatus,
    ) -> Result<DataPlane, StoreError> {
        let mut state = self.lock();
        let what = format!("DataPlane {}", dataplane.name_any());
        if std::mem::take(&mut state.conflict_next_status_patch) {
            return Err(StoreError::Conflict(what));
        }

        let n = state.tick();
        let key = (dataplane.namespace().unwrap_or_default(), dataplane.name_any());
        let stored = state
            .dataplanes
            .get_mut(&key)
            .ok_or_else(|| StoreError::NotFound(what.clone()))?;

        if dataplane.metadata.resource_version.is_some()
            && dataplane.metadata.resource_version != stored.metadata.resource_version
        {
            return Err(StoreError::Conflict(what));
        }

        stored.status = Some(status.clone());
        stored.metadata.resource_version = Some(n.to_string());
        Ok(stored.clone())
    }

    async fn remove_dataplane_annotation(
        &self,
        dataplane: &DataPlane,
        key: &str,
    ) -> Result<(), StoreError> {
        let mut state = self.lock();
        state.take_failure(FailPoint::AnnotationRemoval)?;
        let n = state.tick();
        let stored = state
            .dataplanes
            .get_mut(&(dataplane.namespace().unwrap_or_default(), dataplane.name_any()))
            .ok_or_else(|| StoreError::NotFound(format!("DataPlane {}", dataplane.name_any())))?;

        if let Some(annotations) = stored.metadata.annotations.as_mut() {
            annotations.remove(key);
        }
        stored.metadata.resource_version = Some(n.to_string());
        Ok(())
    }

    async fn list_owned(
        &self,
        kind: OwnedKind,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<OwnedObject>, StoreError> {
        Ok(self
            .lock()
            .objects
            .iter()
            .filter(|o| o.kind() == kind && o.namespace() == namespace)
            .filter(|o| contains_all(o.meta().labels.as_ref(), labels))
            .cloned()
            .collect())
    }

    async fn create_owned(&self, mut object: OwnedObject) -> Result<OwnedObject, StoreError> {
        let mut state = self.lock();
        let n = state.tick();

        let meta = object.meta_mut();
        if meta.name.is_none() {
            let prefix = meta.generate_name.clone().unwrap_or_default();
            meta.name = Some(format!("{}{:05}", prefix, n));
        }
        meta.namespace.get_or_insert_with(|| "default".to_string());
        meta.uid = Some(format!("uid-{}", n));
        meta.resource_version = Some(n.to_string());
        meta.creation_timestamp = Some(timestamp(n));

        if state
            .position(object.kind(), &object.namespace(), &object.name())
            .is_some()
        {
            return Err(StoreError::Conflict(format!("{} {} already exists", object.kind(), object.name())));
        }

        if let OwnedObject::Service(svc) = &mut object {
            if let Some(spec) = svc.spec.as_mut() {
                if spec.cluster_ip.is_none() {
                    state.next_cluster_ip += 1;
                    let ip = format!("10.0.0.{}", state.next_cluster_ip);
                    spec.cluster_ip = Some(ip.clone());
                    spec.cluster_ips = Some(vec![ip]);
                }
            }
        }

        state.objects.push(object.clone());
        Ok(object)
    }

    async fn replace_owned(&self, mut object: OwnedObject) -> Result<OwnedObject, StoreError> {
        let mut state = self.lock();
        state.take_failure(FailPoint::Replace(object.kind()))?;
        let what = format!("{} {}", object.kind(), object.name());
        let idx = state
            .position(object.kind(), &object.namespace(), &object.name())
            .ok_or_else(|| StoreError::NotFound(what.clone()))?;

        let stored = state.objects[idx].clone();
        if object.meta().resource_version.is_some()
            && object.meta().resource_version != stored.meta().resource_version
        {
            return Err(StoreError::Conflict(what));
        }

        let n = state.tick();
        carry_status(&stored, &mut object);
        let meta = object.meta_mut();
        meta.uid = stored.meta().uid.clone();
        meta.creation_timestamp = stored.meta().creation_timestamp.clone();
        meta.deletion_timestamp = stored.meta().deletion_timestamp.clone();
        meta.resource_version = Some(n.to_string());

        let finalized = meta.deletion_timestamp.is_some()
            && meta.finalizers.as_ref().map_or(true, |f| f.is_empty());
        if finalized {
            state.objects.remove(idx);
        } else {
            state.objects[idx] = object.clone();
        }
        Ok(object)
    }

    async fn delete_owned(&self, kind: OwnedKind, namespace: &str, name: &str) -> Result<(), StoreError> {
        let mut state = self.lock();
        let idx = state
            .position(kind, namespace, name)
            .ok_or_else(|| StoreError::NotFound(format!("{} {}", kind, name)))?;

        let blocked = state.objects[idx]
            .meta()
            .finalizers
            .as_ref()
            .is_some_and(|f| !f.is_empty());

        if blocked {
            let n = state.tick();
            let meta = state.objects[idx].meta_mut();
            if meta.deletion_timestamp.is_none() {
                meta.deletion_timestamp = Some(timestamp(n));
            }
            meta.resource_version = Some(n.to_string());
        } else {
            state.objects.remove(idx);
        }
        Ok(())
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, StoreError> {
        let state = self.lock();
        Ok(state
            .position(OwnedKind::Secret, namespace, name)
            .map(|idx| state.objects[idx].clone())
            .and_then(Secret::from_object))
    }

    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<Option<ConfigMap>, StoreError> {
        Ok(self
            .lock()
            .config_maps
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }
}
