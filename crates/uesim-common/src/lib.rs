//! Common types for the uesim operator: CRD, errors, and Kubernetes events

#![deny(missing_docs)]

pub mod crd;
pub mod error;
pub mod events;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Default port for the action HTTP server
pub const DEFAULT_ACTION_PORT: u16 = 8089;

/// Name of the container running the UE simulator inside the workload pod
pub const UE_CONTAINER_NAME: &str = "uesim";

/// Name of the managed service inside the workload container
pub const UE_SERVICE_NAME: &str = "uesim";

/// Full path of the rendered UE configuration inside the workload
/// container. The directory must be backed by a volume so the file
/// survives container restarts.
pub const UE_CONFIG_PATH: &str = "/etc/ueransim/ue.yaml";

/// UDP port of the UE GTP user-plane tunnel, exposed through a per-unit
/// Service so traffic can reach the workload pod.
pub const UE_GTP_PORT: i32 = 4997;
