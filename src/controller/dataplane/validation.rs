//! Runtime checks on the DataPlane spec beyond what the CRD schema enforces

use crate::crd::DataPlane;

/// Validate a DataPlane spec
///
/// Returns a user-facing message for the first problem found.
pub fn validate_dataplane(dataplane: &DataPlane) -> Result<(), String> {
    let spec = &dataplane.spec;

    if let Some(replicas) = spec.deployment.replicas {
        if replicas < 0 {
            return Err(format!("replicas must be >= 0 (got {})", replicas));
        }
    }

    if let Some(hpa) = dataplane.horizontal_scaling() {
        let min = hpa.min_replicas.unwrap_or(1);
        if min < 1 {
            return Err(format!("scaling.horizontalScaling.minReplicas must be >= 1 (got {})", min));
        }
        if hpa.max_replicas < min {
            return Err(format!(
                "scaling.horizontalScaling.maxReplicas ({}) must be >= minReplicas ({})",
                hpa.max_replicas, min
            ));
        }
    }

    if let Some(pdb) = &spec.resources.pod_disruption_budget {
        if pdb.spec.min_available.is_some() && pdb.spec.max_unavailable.is_some() {
            return Err("podDisruptionBudget cannot set both minAvailable and maxUnavailable".to_string());
        }
    }

    if let Some(ingress) = dataplane.ingress_options() {
        for port in &ingress.ports {
            if !(1..=65535).contains(&port.port) {
                return Err(format!("ingress port {} must be between 1 and 65535 (got {})", port.name, port.port));
            }
            if let Some(node_port) = port.node_port {
                if !(1..=65535).contains(&node_port) {
                    return Err(format!(
                        "ingress nodePort for {} must be between 1 and 65535 (got {})",
                        port.name, node_port
                    ));
                }
            }
        }
    }

    // The resource plan lives under blueGreen, so this also rejects a
    // plan without a blue/green strategy.
    if let Some(rollout) = &spec.deployment.rollout {
        if rollout.strategy.blue_green.is_none() {
            return Err("rollout.strategy must set blueGreen".to_string());
        }
    }

    Ok(())
}
