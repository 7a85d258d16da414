//! Releasing children whose DataPlane is gone
//!
//! Every child carries the wait-for-owner finalizer. Once the owning
//! DataPlane is deleted (or replaced by a new object of the same name) the
//! finalizer is removed so garbage collection can finish.

use crate::controller::dataplane::reconcile::{Context, ReconcileError};
use crate::controller::labels::{owner_labels, APP_LABEL, MANAGED_BY_LABEL, MANAGED_BY_VALUE, WAIT_FOR_OWNER_FINALIZER};
use crate::controller::owned::{OwnedKind, OwnedObject, OwnedResource};
use crate::controller::store::{ClusterStore, StoreError};
use futures::StreamExt;
use kube::runtime::{watcher, WatchStreamExt};
use kube::Api;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Drop the finalizer from one object; false if it was already gone
async fn strip_finalizer(store: &dyn ClusterStore, mut object: OwnedObject) -> Result<bool, StoreError> {
    if !object.remove_finalizer(WAIT_FOR_OWNER_FINALIZER) {
        return Ok(false);
    }

    match store.replace_owned(object).await {
        Ok(_) => Ok(true),
        Err(StoreError::NotFound(_)) => Ok(false),
        Err(e) => Err(e),
    }
}

/// Release every child of the named DataPlane
///
/// Returns how many objects had the finalizer removed.
pub async fn release_orphans(ctx: &Context, namespace: &str, dataplane: &str) -> Result<usize, ReconcileError> {
    let labels = owner_labels(dataplane);
    let mut released = 0;

    for kind in OwnedKind::ALL {
        let objects = ctx.store.list_owned(kind, namespace, &labels).await?;
        for object in objects {
            let name = object.name();
            if strip_finalizer(ctx.store.as_ref(), object).await? {
                debug!(dataplane = ?dataplane, kind = %kind, name = ?name, "Released child");
                released += 1;
            }
        }
    }

    Ok(released)
}

/// Release `object` if it is being deleted and its owner no longer exists
///
/// The owner counts as gone when it is not found, is itself being deleted,
/// or is a newer object that does not appear in `object`'s owner references.
pub async fn release_if_orphaned(store: &dyn ClusterStore, object: OwnedObject) -> Result<bool, StoreError> {
    if object.meta().deletion_timestamp.is_none() || !object.has_finalizer(WAIT_FOR_OWNER_FINALIZER) {
        return Ok(false);
    }

    let namespace = object.namespace();
    let owner = object
        .meta()
        .labels
        .as_ref()
        .and_then(|labels| labels.get(APP_LABEL))
        .cloned();

    let orphaned = match owner {
        None => true,
        Some(owner) => match store.get_dataplane(&namespace, &owner).await {
            Err(StoreError::NotFound(_)) => true,
            Err(e) => return Err(e),
            Ok(dataplane) => {
                let uid = dataplane.metadata.uid.unwrap_or_default();
                dataplane.metadata.deletion_timestamp.is_some()
                    || !object
                        .meta()
                        .owner_references
                        .iter()
                        .flatten()
                        .any(|r| r.uid == uid)
            }
        },
    };

    if !orphaned {
        return Ok(false);
    }

    let (kind, name) = (object.kind(), object.name());
    let released = strip_finalizer(store, object).await?;
    if released {
        info!(kind = %kind, name = ?name, namespace = ?namespace, "Released orphaned child");
    }
    Ok(released)
}

/// Watch children of kind `K` and release the orphaned ones
///
/// Runs until the watch stream ends.
pub async fn run_orphan_watcher<K: OwnedResource>(client: kube::Client, store: Arc<dyn ClusterStore>) {
    let api: Api<K> = Api::all(client);
    let selector = format!("{}={}", MANAGED_BY_LABEL, MANAGED_BY_VALUE);

    let mut events = watcher(api, watcher::Config::default().labels(&selector))
        .default_backoff()
        .applied_objects()
        .boxed();

    while let Some(event) = events.next().await {
        match event {
            Ok(object) => {
                let object = object.into_object();
                let name = object.name();
                if let Err(e) = release_if_orphaned(store.as_ref(), object).await {
                    warn!(kind = %K::KIND, name = ?name, error = %e, "Failed to release orphaned child");
                }
            }
            Err(e) => warn!(kind = %K::KIND, error = %e, "Orphan watch error"),
        }
    }
}
