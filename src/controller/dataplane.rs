pub mod base;
pub mod bluegreen;
pub mod certificate;
pub mod deployment;
pub mod image;
pub mod orphans;
pub mod overrides;
pub mod reconcile;
pub mod scaling;
pub mod services;
pub mod status;
pub mod validation;

pub use reconcile::{reconcile, Context, ReconcileError};

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Tests can use unwrap/expect for brevity
#[path = "dataplane_test.rs"]
mod tests;
