pub mod dataplane;

pub use dataplane::{DataPlane, DataPlaneSpec, DataPlaneStatus};
