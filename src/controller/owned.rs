//! Objects owned by a DataPlane
//!
//! `OwnedResource` is implemented by each child kind. Generic code lists,
//! reduces and deletes children through it, while the store only ever sees
//! the closed `OwnedObject` enum.

use crate::controller::extensions::PreDeleteHook;
use crate::controller::labels::WAIT_FOR_OWNER_FINALIZER;
use crate::controller::store::{ClusterStore, StoreError};
use crate::crd::DataPlane;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::autoscaling::v2::HorizontalPodAutoscaler;
use k8s_openapi::api::core::v1::{Secret, Service};
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::NamespaceResourceScope;
use kube::{Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use tracing::info;

/// Outcome of an ensure operation
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EnsureResult {
    Created,
    Updated,
    Noop,
    Deleted,
}

impl EnsureResult {
    /// Created, Updated and Deleted all end the pass; the change itself
    /// produces the next watch event.
    pub fn changed(&self) -> bool {
        !matches!(self, EnsureResult::Noop)
    }
}

/// Child kinds a DataPlane owns
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OwnedKind {
    Deployment,
    Service,
    Secret,
    HorizontalPodAutoscaler,
    PodDisruptionBudget,
}

impl OwnedKind {
    pub const ALL: [OwnedKind; 5] = [
        OwnedKind::Deployment,
        OwnedKind::Service,
        OwnedKind::Secret,
        OwnedKind::HorizontalPodAutoscaler,
        OwnedKind::PodDisruptionBudget,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OwnedKind::Deployment => "Deployment",
            OwnedKind::Service => "Service",
            OwnedKind::Secret => "Secret",
            OwnedKind::HorizontalPodAutoscaler => "HorizontalPodAutoscaler",
            OwnedKind::PodDisruptionBudget => "PodDisruptionBudget",
        }
    }
}

impl fmt::Display for OwnedKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Any child object, as the store sees it
#[derive(Clone, Debug, PartialEq)]
pub enum OwnedObject {
    Deployment(Deployment),
    Service(Service),
    Secret(Secret),
    HorizontalPodAutoscaler(HorizontalPodAutoscaler),
    PodDisruptionBudget(PodDisruptionBudget),
}

impl OwnedObject {
    pub fn kind(&self) -> OwnedKind {
        match self {
            OwnedObject::Deployment(_) => OwnedKind::Deployment,
            OwnedObject::Service(_) => OwnedKind::Service,
            OwnedObject::Secret(_) => OwnedKind::Secret,
            OwnedObject::HorizontalPodAutoscaler(_) => OwnedKind::HorizontalPodAutoscaler,
            OwnedObject::PodDisruptionBudget(_) => OwnedKind::PodDisruptionBudget,
        }
    }

    pub fn meta(&self) -> &ObjectMeta {
        match self {
            OwnedObject::Deployment(o) => o.meta(),
            OwnedObject::Service(o) => o.meta(),
            OwnedObject::Secret(o) => o.meta(),
            OwnedObject::HorizontalPodAutoscaler(o) => o.meta(),
            OwnedObject::PodDisruptionBudget(o) => o.meta(),
        }
    }

    pub fn meta_mut(&mut self) -> &mut ObjectMeta {
        match self {
            OwnedObject::Deployment(o) => o.meta_mut(),
            OwnedObject::Service(o) => o.meta_mut(),
            OwnedObject::Secret(o) => o.meta_mut(),
            OwnedObject::HorizontalPodAutoscaler(o) => o.meta_mut(),
            OwnedObject::PodDisruptionBudget(o) => o.meta_mut(),
        }
    }

    pub fn name(&self) -> String {
        self.meta().name.clone().unwrap_or_default()
    }

    pub fn namespace(&self) -> String {
        self.meta().namespace.clone().unwrap_or_default()
    }

    pub fn has_finalizer(&self, finalizer: &str) -> bool {
        self.meta()
            .finalizers
            .as_ref()
            .is_some_and(|f| f.iter().any(|x| x == finalizer))
    }

    /// Drop `finalizer`; returns false if it was not set
    pub fn remove_finalizer(&mut self, finalizer: &str) -> bool {
        let Some(finalizers) = self.meta_mut().finalizers.as_mut() else {
            return false;
        };
        let before = finalizers.len();
        finalizers.retain(|f| f != finalizer);
        before != finalizers.len()
    }
}

/// A concrete child kind
///
/// Finalizers and owner references come from `kube::ResourceExt`; `Clone`
/// is the deep copy.
pub trait OwnedResource:
    Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Clone
    + fmt::Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
    const KIND: OwnedKind;

    fn into_object(self) -> OwnedObject;

    fn from_object(object: OwnedObject) -> Option<Self>;
}

macro_rules! owned_resource {
    ($ty:ident) => {
        impl OwnedResource for $ty {
            const KIND: OwnedKind = OwnedKind::$ty;

            fn into_object(self) -> OwnedObject {
                OwnedObject::$ty(self)
            }

            fn from_object(object: OwnedObject) -> Option<Self> {
                match object {
                    OwnedObject::$ty(o) => Some(o),
                    _ => None,
                }
            }
        }
    };
}

owned_resource!(Deployment);
owned_resource!(Service);
owned_resource!(Secret);
owned_resource!(HorizontalPodAutoscaler);
owned_resource!(PodDisruptionBudget);

/// How a new child gets its name
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChildName {
    Fixed(String),
    /// `metadata.generateName` prefix
    Generate(String),
}

/// Metadata for a new child: namespace, labels, controller owner
/// reference and the wait-for-owner finalizer
pub fn child_meta(owner: &DataPlane, name: ChildName, labels: BTreeMap<String, String>) -> ObjectMeta {
    let (name, generate_name) = match name {
        ChildName::Fixed(name) => (Some(name), None),
        ChildName::Generate(prefix) => (None, Some(prefix)),
    };

    ObjectMeta {
        name,
        generate_name,
        namespace: owner.namespace(),
        labels: Some(labels),
        owner_references: owner.controller_owner_ref(&()).map(|r| vec![r]),
        finalizers: Some(vec![WAIT_FOR_OWNER_FINALIZER.to_string()]),
        ..Default::default()
    }
}

/// True if `object` has an owner reference to `owner`
pub fn is_owned_by<K: Resource>(object: &K, owner: &DataPlane) -> bool {
    let Some(uid) = owner.meta().uid.as_deref() else {
        return false;
    };
    object.owner_references().iter().any(|r| r.uid == uid)
}

/// List children of `owner` of kind `K` carrying all of `labels`
pub async fn list_for_owner<K: OwnedResource>(
    store: &dyn ClusterStore,
    owner: &DataPlane,
    labels: &BTreeMap<String, String>,
) -> Result<Vec<K>, StoreError> {
    let namespace = owner.namespace().unwrap_or_default();
    let objects = store.list_owned(K::KIND, &namespace, labels).await?;

    Ok(objects
        .into_iter()
        .filter_map(K::from_object)
        .filter(|o| is_owned_by(o, owner))
        .collect())
}

/// Pick the object to keep out of a set of duplicates: the one named
/// `authoritative` when given and present, else the most recently created
pub fn select_survivor<K: Resource>(items: &[K], authoritative: Option<&str>) -> Option<usize> {
    if let Some(name) = authoritative {
        if let Some(idx) = items.iter().position(|o| o.meta().name.as_deref() == Some(name)) {
            return Some(idx);
        }
    }

    items
        .iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| {
            let (a, b) = (a.meta(), b.meta());
            a.creation_timestamp
                .cmp(&b.creation_timestamp)
                .then_with(|| a.name.cmp(&b.name))
        })
        .map(|(idx, _)| idx)
}

/// Create a child and return it as stored
pub async fn create_child<K: OwnedResource>(store: &dyn ClusterStore, object: K) -> Result<K, StoreError> {
    let created = store.create_owned(object.into_object()).await?;
    K::from_object(created).ok_or(StoreError::UnexpectedKind(K::KIND))
}

/// Replace a child and return it as stored
pub async fn replace_child<K: OwnedResource>(store: &dyn ClusterStore, object: K) -> Result<K, StoreError> {
    let replaced = store.replace_owned(object.into_object()).await?;
    K::from_object(replaced).ok_or(StoreError::UnexpectedKind(K::KIND))
}

/// Delete one child, running the pre-delete hook first
pub async fn delete_owned<K: OwnedResource>(
    store: &dyn ClusterStore,
    hook: &dyn PreDeleteHook,
    object: K,
) -> Result<(), StoreError> {
    let object = object.into_object();
    hook.before_delete(store, &object).await?;

    match store
        .delete_owned(object.kind(), &object.namespace(), &object.name())
        .await
    {
        Ok(()) | Err(StoreError::NotFound(_)) => Ok(()),
        Err(e) => Err(e),
    }
}

/// Reduce duplicates to a single object
///
/// Returns the number of deleted objects. Callers must not keep using any
/// handle they held on the set afterwards.
pub async fn reduce_to_one<K: OwnedResource>(
    store: &dyn ClusterStore,
    hook: &dyn PreDeleteHook,
    mut items: Vec<K>,
    authoritative: Option<&str>,
) -> Result<usize, StoreError> {
    let Some(keep) = select_survivor(&items, authoritative) else {
        return Ok(0);
    };
    let survivor = items.swap_remove(keep);

    let deleted = items.len();
    for item in items {
        info!(
            kind = %K::KIND,
            name = ?item.name_any(),
            kept = ?survivor.name_any(),
            "Deleting duplicate child"
        );
        delete_owned(store, hook, item).await?;
    }
    Ok(deleted)
}
