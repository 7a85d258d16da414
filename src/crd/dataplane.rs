use k8s_openapi::api::autoscaling::v2::MetricSpec;
use k8s_openapi::api::core::v1::PodTemplateSpec;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Condition type for top-level serving readiness
pub const READY_CONDITION: &str = "Ready";

/// Condition type for blue/green rollout progress (lives in `status.rollout`)
pub const ROLLED_OUT_CONDITION: &str = "RolledOut";

/// Annotation that releases a `BreakBeforePromotion` rollout
pub const PROMOTE_WHEN_READY_ANNOTATION: &str = "gateway-operator.dev/promote-when-ready";

/// DataPlane is a managed gateway workload reconciled toward its declared state
///
/// Owns a proxy Deployment, an admin API Service, an ingress Service, a TLS
/// Secret and optionally a HorizontalPodAutoscaler and PodDisruptionBudget.
/// With a blue/green rollout configured, a parallel preview copy of those
/// children is built for every new generation and promoted by selector swap.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    group = "gateway-operator.dev",
    version = "v1beta1",
    kind = "DataPlane",
    namespaced,
    status = "DataPlaneStatus",
    derive = "PartialEq",
    printcolumn = r#"{"name":"Ready", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#,
    printcolumn = r#"{"name":"Replicas", "type":"integer", "jsonPath":".status.readyReplicas"}"#,
    printcolumn = r#"{"name":"Service", "type":"string", "jsonPath":".status.service"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct DataPlaneSpec {
    /// Proxy workload options
    #[serde(default)]
    pub deployment: DeploymentOptions,

    /// Network endpoint options
    #[serde(default)]
    pub network: NetworkOptions,

    /// Ancillary resources (disruption budget)
    #[serde(default)]
    pub resources: ResourceOptions,

    /// Extensions applied to the spec before the workload is generated
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extensions: Vec<ExtensionRef>,

    /// Custom plugins whose config maps are mounted into the proxy
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub plugins_to_install: Vec<PluginRef>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentOptions {
    /// Number of desired proxy pods (defaults to 1)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,

    /// User overrides merged on top of the generated pod template
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pod_template_spec: Option<PodTemplateSpec>,

    /// Autoscaling configuration
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scaling: Option<Scaling>,

    /// Rollout configuration; absent means in-place updates
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rollout: Option<RolloutConfig>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Scaling {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub horizontal_scaling: Option<HorizontalScaling>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HorizontalScaling {
    /// Lower bound for the autoscaler (defaults to 1)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_replicas: Option<i32>,

    /// Upper bound for the autoscaler
    pub max_replicas: i32,

    /// Autoscaler metrics, passed through verbatim
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub metrics: Vec<MetricSpec>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct RolloutConfig {
    pub strategy: RolloutStrategy,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RolloutStrategy {
    /// Blue-Green rollout: preview copy, health gate, selector swap
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blue_green: Option<BlueGreenStrategy>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct BlueGreenStrategy {
    #[serde(default)]
    pub promotion: Promotion,

    #[serde(default)]
    pub resources: RolloutResources,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct Promotion {
    #[serde(default)]
    pub strategy: PromotionStrategy,
}

/// How a ready preview cohort gets promoted
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum PromotionStrategy {
    /// Promote as soon as the preview cohort is ready
    AutomaticPromotion,
    /// Wait for the promote-when-ready annotation
    #[default]
    BreakBeforePromotion,
    /// Any value this operator does not know about
    #[serde(other)]
    #[schemars(skip)]
    Unsupported,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct RolloutResources {
    #[serde(default)]
    pub plan: RolloutResourcePlan,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct RolloutResourcePlan {
    #[serde(default)]
    pub deployment: DeploymentPlan,
}

/// What happens to the preview workload between rollouts
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum DeploymentPlan {
    /// Keep the preview Deployment at zero replicas until the next rollout
    #[default]
    ScaleDownOnPromotionScaleUpOnRollout,
    /// Delete the preview Deployment after promotion, recreate it on the next rollout
    DeleteOnPromotionRecreateOnRollout,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct NetworkOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub services: Option<ServiceOptions>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct ServiceOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ingress: Option<IngressServiceOptions>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct IngressServiceOptions {
    /// Fixed name for the live ingress Service (generated when absent)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Service type (defaults to LoadBalancer)
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub service_type: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,

    /// Only enforced when set; otherwise left to whoever else manages it
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_traffic_policy: Option<String>,

    /// Exposed ports (defaults to 80->8000 and 443->8443)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<IngressServicePort>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct IngressServicePort {
    pub name: String,
    pub port: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_port: Option<IntOrString>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_port: Option<i32>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResourceOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pod_disruption_budget: Option<PodDisruptionBudgetOptions>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct PodDisruptionBudgetOptions {
    #[serde(default)]
    pub spec: PodDisruptionBudgetSpecOptions,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PodDisruptionBudgetSpecOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_available: Option<IntOrString>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_unavailable: Option<IntOrString>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct ExtensionRef {
    pub group: String,
    pub kind: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct PluginRef {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// Status of a condition
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

/// Condition describes one observed aspect of the DataPlane
///
/// Option fields serialize as null on purpose: status writes are merge
/// patches and null is what removes a previously-set field.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: ConditionStatus,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
    pub observed_generation: Option<i64>,
    /// RFC3339, updated only when `status` flips
    pub last_transition_time: Option<String>,
}

/// Reasons carried by the `RolledOut` condition
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RolloutReason {
    Initialized,
    Progressing,
    AwaitingPromotion,
    PromotionInProgress,
    PromotionDone,
    PromotionFailed,
    WaitingForChange,
}

impl RolloutReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RolloutReason::Initialized => "RolloutInitialized",
            RolloutReason::Progressing => "RolloutProgressing",
            RolloutReason::AwaitingPromotion => "RolloutAwaitingPromotion",
            RolloutReason::PromotionInProgress => "RolloutPromotionInProgress",
            RolloutReason::PromotionDone => "RolloutPromotionDone",
            RolloutReason::PromotionFailed => "RolloutPromotionFailed",
            RolloutReason::WaitingForChange => "RolloutWaitingForChange",
        }
    }

    pub fn parse(reason: &str) -> Option<Self> {
        [
            RolloutReason::Initialized,
            RolloutReason::Progressing,
            RolloutReason::AwaitingPromotion,
            RolloutReason::PromotionInProgress,
            RolloutReason::PromotionDone,
            RolloutReason::PromotionFailed,
            RolloutReason::WaitingForChange,
        ]
        .into_iter()
        .find(|r| r.as_str() == reason)
    }

    /// `True` once the promoted cohort serves this generation
    pub fn condition_status(&self) -> ConditionStatus {
        match self {
            RolloutReason::PromotionDone | RolloutReason::WaitingForChange => ConditionStatus::True,
            _ => ConditionStatus::False,
        }
    }
}

/// Reasons carried by the `Ready` condition
pub const READY_REASON: &str = "Ready";
pub const WAITING_TO_BECOME_READY_REASON: &str = "WaitingToBecomeReady";

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum AddressType {
    IPAddress,
    Hostname,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum AddressSourceType {
    PublicLoadBalancer,
    PrivateLoadBalancer,
    PrivateIP,
}

/// A network address the DataPlane is reachable at
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Address {
    #[serde(rename = "type")]
    pub address_type: AddressType,
    pub value: String,
    pub source_type: AddressSourceType,
}

/// Status of the DataPlane
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DataPlaneStatus {
    #[serde(default)]
    pub conditions: Vec<Condition>,

    /// Name of the live ingress Service
    pub service: Option<String>,

    /// Addresses of the live ingress Service
    #[serde(default)]
    pub addresses: Vec<Address>,

    /// Selector token of the live cohort
    pub selector: Option<String>,

    #[serde(default)]
    pub replicas: i32,

    #[serde(default)]
    pub ready_replicas: i32,

    /// Present only while a rollout strategy is configured
    pub rollout: Option<RolloutStatus>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct RolloutStatus {
    #[serde(default)]
    pub conditions: Vec<Condition>,

    #[serde(default)]
    pub deployment: RolloutDeploymentStatus,

    #[serde(default)]
    pub services: RolloutServicesStatus,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct RolloutDeploymentStatus {
    /// Selector token of the current preview cohort
    pub selector: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RolloutServicesStatus {
    #[serde(rename = "adminAPI")]
    pub admin_api: Option<RolloutServiceStatus>,
    pub ingress: Option<RolloutServiceStatus>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct RolloutServiceStatus {
    pub name: String,
    #[serde(default)]
    pub addresses: Vec<Address>,
}

/// Find a condition by type
pub fn find_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

impl DataPlane {
    pub fn generation(&self) -> i64 {
        self.metadata.generation.unwrap_or(0)
    }

    pub fn blue_green(&self) -> Option<&BlueGreenStrategy> {
        self.spec
            .deployment
            .rollout
            .as_ref()
            .and_then(|r| r.strategy.blue_green.as_ref())
    }

    pub fn ready_condition(&self) -> Option<&Condition> {
        self.status
            .as_ref()
            .and_then(|s| find_condition(&s.conditions, READY_CONDITION))
    }

    pub fn rolled_out_condition(&self) -> Option<&Condition> {
        self.status
            .as_ref()
            .and_then(|s| s.rollout.as_ref())
            .and_then(|r| find_condition(&r.conditions, ROLLED_OUT_CONDITION))
    }

    /// RolledOut reason, only if the condition was written for the current generation
    pub fn current_rollout_reason(&self) -> Option<RolloutReason> {
        self.rolled_out_condition()
            .filter(|c| c.observed_generation == Some(self.generation()))
            .and_then(|c| RolloutReason::parse(&c.reason))
    }

    /// Selector token of the live cohort
    pub fn live_selector(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|s| s.selector.as_deref())
            .filter(|s| !s.is_empty())
    }

    /// Selector token of the preview cohort
    pub fn preview_selector(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|s| s.rollout.as_ref())
            .and_then(|r| r.deployment.selector.as_deref())
            .filter(|s| !s.is_empty())
    }

    /// True if the promote-when-ready annotation is present with value "true"
    pub fn has_promote_annotation(&self) -> bool {
        self.metadata
            .annotations
            .as_ref()
            .and_then(|annotations| annotations.get(PROMOTE_WHEN_READY_ANNOTATION))
            .map(|value| value == "true")
            .unwrap_or(false)
    }

    /// Desired replica count before autoscaling is considered
    pub fn desired_replicas(&self) -> i32 {
        self.spec.deployment.replicas.unwrap_or(1)
    }

    pub fn horizontal_scaling(&self) -> Option<&HorizontalScaling> {
        self.spec
            .deployment
            .scaling
            .as_ref()
            .and_then(|s| s.horizontal_scaling.as_ref())
    }

    pub fn ingress_options(&self) -> Option<&IngressServiceOptions> {
        self.spec
            .network
            .services
            .as_ref()
            .and_then(|s| s.ingress.as_ref())
    }
}

#[cfg(test)]
#[path = "dataplane_test.rs"]
mod tests;
