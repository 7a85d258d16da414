//! DataPlane operator
//!
//! Reconciles `DataPlane` resources into a proxy Deployment, its admin and
//! ingress Services, an mTLS Secret and optional autoscaling/disruption
//! budget objects, with an optional blue/green rollout on top.

pub mod config;
pub mod controller;
pub mod crd;
pub mod server;
