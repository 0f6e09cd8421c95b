//! Entity model — persisted configuration and state for containers, pods,
//! volumes, and exec sessions.

pub mod container;
pub mod exec;
pub mod pod;
pub mod volume;

pub use container::{
    CgroupManager, ContainerConfig, ContainerState, ContainerStatus, HealthCheckConfig,
    HealthCheckStatus, MountSpec, NamedVolumeRef, NetworkStatus, PerNetworkOptions, PortMapping,
    RestartPolicy,
};
pub use exec::ExecSession;
pub use pod::{ExitPolicy, PodConfig, PodState, SharedNamespaces};
pub use volume::{VolumeConfig, VolumeState};
