pub mod clock;
pub mod dataplane;
pub mod extensions;
pub mod labels;
pub mod owned;
pub mod pki;
pub mod store;

#[cfg(test)]
pub mod store_mock;

pub use dataplane::{reconcile, Context, ReconcileError};
