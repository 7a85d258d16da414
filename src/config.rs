//! Runtime configuration, read once from the environment at startup.

use serde::Deserialize;

/// Prefix shared by every configuration variable
pub const ENV_PREFIX: &str = "DATAPLANE_OPERATOR_";

/// Proxy image used when neither the DataPlane nor `RELATED_IMAGE` names one
pub const DEFAULT_PROXY_IMAGE: &str = "kong:3.9";

/// Operator configuration
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct OperatorConfig {
    /// Image used when the DataPlane does not set one.
    #[serde(default = "default_image")]
    pub default_image: String,

    /// Image override taking precedence over `default_image`
    /// (set by packaging, e.g. OLM related images).
    #[serde(default)]
    pub related_image: Option<String>,

    /// Reject proxy images whose tag is not a supported version.
    #[serde(default = "default_true")]
    pub validate_images: bool,

    /// Secret holding the CA that signs admin API certificates.
    #[serde(default = "default_ca_secret")]
    pub cluster_ca_secret: String,

    #[serde(default = "default_ca_namespace")]
    pub cluster_ca_namespace: String,

    /// Port for `/healthz`, `/readyz` and `/metrics`.
    #[serde(default = "default_health_port")]
    pub health_port: u16,

    /// Backoff applied by the error policy.
    #[serde(default = "default_requeue_seconds")]
    pub requeue_seconds: u64,
}

fn default_image() -> String {
    DEFAULT_PROXY_IMAGE.to_string()
}

fn default_true() -> bool {
    true
}

fn default_ca_secret() -> String {
    "dataplane-operator-ca".to_string()
}

fn default_ca_namespace() -> String {
    "dataplane-operator-system".to_string()
}

fn default_health_port() -> u16 {
    8080
}

fn default_requeue_seconds() -> u64 {
    10
}

impl OperatorConfig {
    /// Build the config from `DATAPLANE_OPERATOR_*` environment variables
    pub fn from_env() -> Result<Self, envy::Error> {
        envy::prefixed(ENV_PREFIX).from_env()
    }

    /// The image to run when the DataPlane itself does not set one
    pub fn fallback_image(&self) -> &str {
        self.related_image
            .as_deref()
            .filter(|image| !image.is_empty())
            .unwrap_or(&self.default_image)
    }
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            default_image: default_image(),
            related_image: None,
            validate_images: true,
            cluster_ca_secret: default_ca_secret(),
            cluster_ca_namespace: default_ca_namespace(),
            health_port: default_health_port(),
            requeue_seconds: default_requeue_seconds(),
        }
    }
}
