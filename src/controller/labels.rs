//! Labels, annotations and finalizers that address DataPlane children
//!
//! Every child is found again through its labels alone, so the cohort state
//! and service type are kept as enums in code and only turned into strings
//! here, at the API boundary.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::BTreeMap;
use std::fmt;

/// Name of the owning DataPlane
pub const APP_LABEL: &str = "gateway-operator.dev/app";

/// Marks objects managed by this operator
pub const MANAGED_BY_LABEL: &str = "gateway-operator.dev/managed-by";
pub const MANAGED_BY_VALUE: &str = "dataplane";

/// `live` or `preview`
pub const STATE_LABEL: &str = "gateway-operator.dev/dataplane-state";

/// `admin` or `ingress`, on Services only
pub const SERVICE_TYPE_LABEL: &str = "gateway-operator.dev/dataplane-service-type";

/// Selector token shared by a cohort's pods, Deployment and Services
pub const SELECTOR_LABEL: &str = "gateway-operator.dev/selector";

/// Blocks deletion of a child until its DataPlane is gone
pub const WAIT_FOR_OWNER_FINALIZER: &str = "gateway-operator.dev/wait-for-owner";

/// Which cohort a child belongs to
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CohortState {
    /// Serving traffic
    Live,
    /// Built from the latest spec, not yet serving
    Preview,
}

impl CohortState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CohortState::Live => "live",
            CohortState::Preview => "preview",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "live" => Some(CohortState::Live),
            "preview" => Some(CohortState::Preview),
            _ => None,
        }
    }
}

impl fmt::Display for CohortState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The two Services every cohort has
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ServiceKind {
    Admin,
    Ingress,
}

impl ServiceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceKind::Admin => "admin",
            ServiceKind::Ingress => "ingress",
        }
    }
}

/// Typed address of one child of a DataPlane
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChildLabels<'a> {
    pub dataplane: &'a str,
    pub state: CohortState,
    pub service: Option<ServiceKind>,
}

impl<'a> ChildLabels<'a> {
    pub fn new(dataplane: &'a str, state: CohortState) -> Self {
        Self {
            dataplane,
            state,
            service: None,
        }
    }

    pub fn service(dataplane: &'a str, state: CohortState, kind: ServiceKind) -> Self {
        Self {
            dataplane,
            state,
            service: Some(kind),
        }
    }

    pub fn to_map(&self) -> BTreeMap<String, String> {
        let mut labels = owner_labels(self.dataplane);
        labels.insert(STATE_LABEL.to_string(), self.state.as_str().to_string());
        if let Some(kind) = self.service {
            labels.insert(SERVICE_TYPE_LABEL.to_string(), kind.as_str().to_string());
        }
        labels
    }
}

/// Labels carried by every child of the named DataPlane
pub fn owner_labels(dataplane: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (APP_LABEL.to_string(), dataplane.to_string()),
        (MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string()),
    ])
}

/// Pod labels a cohort's Deployment and Services select on
pub fn selector_labels(dataplane: &str, token: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (APP_LABEL.to_string(), dataplane.to_string()),
        (SELECTOR_LABEL.to_string(), token.to_string()),
    ])
}

/// Cohort state recorded on an object, if any
pub fn cohort_state(meta: &ObjectMeta) -> Option<CohortState> {
    meta.labels
        .as_ref()
        .and_then(|labels| labels.get(STATE_LABEL))
        .and_then(|value| CohortState::parse(value))
}

/// True if every entry of `subset` is present in `labels`
pub fn contains_all(labels: Option<&BTreeMap<String, String>>, subset: &BTreeMap<String, String>) -> bool {
    match labels {
        Some(labels) => subset.iter().all(|(k, v)| labels.get(k) == Some(v)),
        None => subset.is_empty(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_child_labels_for_preview_ingress_service() {
        let labels = ChildLabels::service("edge", CohortState::Preview, ServiceKind::Ingress).to_map();

        assert_eq!(labels.get(APP_LABEL).map(String::as_str), Some("edge"));
        assert_eq!(labels.get(MANAGED_BY_LABEL).map(String::as_str), Some("dataplane"));
        assert_eq!(labels.get(STATE_LABEL).map(String::as_str), Some("preview"));
        assert_eq!(labels.get(SERVICE_TYPE_LABEL).map(String::as_str), Some("ingress"));
    }

    #[test]
    fn test_deployment_labels_have_no_service_type() {
        let labels = ChildLabels::new("edge", CohortState::Live).to_map();
        assert!(!labels.contains_key(SERVICE_TYPE_LABEL));
        assert_eq!(labels.len(), 3);
    }

    #[test]
    fn test_cohort_state_round_trip() {
        let meta = ObjectMeta {
            labels: Some(ChildLabels::new("edge", CohortState::Live).to_map()),
            ..Default::default()
        };
        assert_eq!(cohort_state(&meta), Some(CohortState::Live));
        assert_eq!(cohort_state(&ObjectMeta::default()), None);
        assert_eq!(CohortState::parse("blue"), None);
    }

    #[test]
    fn test_contains_all() {
        let wanted = selector_labels("edge", "abc");
        let mut actual = wanted.clone();
        actual.insert("extra".to_string(), "x".to_string());

        assert!(contains_all(Some(&actual), &wanted));
        assert!(!contains_all(Some(&selector_labels("edge", "xyz")), &wanted));
        assert!(!contains_all(None, &wanted));
        assert!(contains_all(None, &BTreeMap::new()));
    }
}
