//! Proxy image selection and version support check

use crate::config::OperatorConfig;
use crate::controller::dataplane::reconcile::ReconcileError;
use k8s_openapi::api::core::v1::PodTemplateSpec;

/// Name of the proxy container in every generated pod template
pub const PROXY_CONTAINER_NAME: &str = "proxy";

/// Oldest supported proxy release
pub const MIN_SUPPORTED_VERSION: (u64, u64) = (3, 0);

/// Pick the proxy image: the user's container image, else the configured
/// fallback (related image override, then default)
pub fn resolve_image(overrides: Option<&PodTemplateSpec>, config: &OperatorConfig) -> String {
    overrides
        .and_then(|template| template.spec.as_ref())
        .and_then(|spec| spec.containers.iter().find(|c| c.name == PROXY_CONTAINER_NAME))
        .and_then(|container| container.image.clone())
        .filter(|image| !image.is_empty())
        .unwrap_or_else(|| config.fallback_image().to_string())
}

/// Tag of an image reference, ignoring any digest and registry port
pub fn image_tag(image: &str) -> Option<&str> {
    let without_digest = image.split('@').next().unwrap_or(image);
    let last_segment = without_digest.rsplit('/').next().unwrap_or(without_digest);
    last_segment.split_once(':').map(|(_, tag)| tag)
}

/// Leading `major.minor` of a tag such as `3.9`, `3.9.1` or `3.9.1-ubuntu`
pub fn parse_version(tag: &str) -> Option<(u64, u64)> {
    let numeric = tag.split(['-', '+']).next()?;
    let mut parts = numeric.split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = match parts.next() {
        Some(minor) => minor.parse().ok()?,
        None => 0,
    };
    Some((major, minor))
}

/// Reject images whose tag is not a supported proxy version
pub fn validate_image(image: &str) -> Result<(), ReconcileError> {
    let unsupported = |reason: &str| ReconcileError::UnsupportedImage {
        image: image.to_string(),
        reason: reason.to_string(),
    };

    let tag = image_tag(image).ok_or_else(|| unsupported("image has no tag"))?;
    let version = parse_version(tag).ok_or_else(|| unsupported("tag is not a version"))?;
    if version < MIN_SUPPORTED_VERSION {
        return Err(unsupported("versions before 3.0 are not supported"));
    }
    Ok(())
}
