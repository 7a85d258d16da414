//! Operator process plumbing
//!
//! Health probes and Prometheus metrics over HTTP, plus signal-driven
//! shutdown for the controller and its background watchers.

mod health;
pub mod metrics;
pub mod shutdown;

pub use health::{build_router, run_health_server, ReadinessState};
pub use metrics::{create_metrics, ControllerMetrics, SharedMetrics};
pub use shutdown::{shutdown_channel, wait_for_signal, ShutdownController, ShutdownSignal};

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[path = "health_test.rs"]
mod health_tests;

#[cfg(test)]
#[allow(clippy::unwrap_used)]
#[path = "shutdown_test.rs"]
mod shutdown_tests;
