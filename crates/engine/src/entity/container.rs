//! Container entity — immutable config, mutable state, and the status enum.
//!
//! Records are stored as JSON. Mutable-state structs default every field so
//! records written by older engine versions still deserialize; migration of
//! deprecated shapes happens on read and is flagged for lazy rewrite.

use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::EngineError;

/// Container lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    #[default]
    Unknown,
    Configured,
    Created,
    Running,
    Paused,
    Stopping,
    Stopped,
    Exited,
    Removing,
}

impl ContainerStatus {
    /// The container's process is alive (or believed alive).
    pub fn is_live(self) -> bool {
        matches!(
            self,
            ContainerStatus::Running | ContainerStatus::Paused | ContainerStatus::Stopping
        )
    }

    /// States from which `init` is legal.
    pub fn can_init(self) -> bool {
        matches!(
            self,
            ContainerStatus::Configured | ContainerStatus::Stopped | ContainerStatus::Exited
        )
    }

    /// States from which `start` is legal (init runs first when needed).
    pub fn can_start(self) -> bool {
        matches!(
            self,
            ContainerStatus::Configured
                | ContainerStatus::Created
                | ContainerStatus::Stopped
                | ContainerStatus::Exited
        )
    }

    pub fn can_stop(self) -> bool {
        matches!(self, ContainerStatus::Running | ContainerStatus::Stopping)
    }
}

impl fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ContainerStatus::Unknown => "unknown",
            ContainerStatus::Configured => "configured",
            ContainerStatus::Created => "created",
            ContainerStatus::Running => "running",
            ContainerStatus::Paused => "paused",
            ContainerStatus::Stopping => "stopping",
            ContainerStatus::Stopped => "stopped",
            ContainerStatus::Exited => "exited",
            ContainerStatus::Removing => "removing",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for ContainerStatus {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unknown" => Ok(ContainerStatus::Unknown),
            "configured" => Ok(ContainerStatus::Configured),
            "created" => Ok(ContainerStatus::Created),
            "running" => Ok(ContainerStatus::Running),
            "paused" => Ok(ContainerStatus::Paused),
            "stopping" => Ok(ContainerStatus::Stopping),
            "stopped" => Ok(ContainerStatus::Stopped),
            "exited" => Ok(ContainerStatus::Exited),
            "removing" => Ok(ContainerStatus::Removing),
            other => Err(EngineError::InvalidArg(format!(
                "unknown container state \"{}\"",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicy {
    #[default]
    No,
    OnFailure,
    Always,
    UnlessStopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CgroupManager {
    #[default]
    Cgroupfs,
    Systemd,
}

/// A bind or tmpfs mount requested at create time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountSpec {
    pub mount_type: String,
    pub source: String,
    pub destination: String,
    #[serde(default)]
    pub options: Vec<String>,
}

/// A named-volume attachment. Anonymous volumes get a generated name and are
/// garbage-collected with their owning container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamedVolumeRef {
    pub name: String,
    pub dest: String,
    #[serde(default)]
    pub options: Vec<String>,
    #[serde(default)]
    pub sub_path: String,
    #[serde(default)]
    pub is_anonymous: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PerNetworkOptions {
    pub interface_name: String,
    pub aliases: Vec<String>,
    pub static_ips: Vec<IpAddr>,
    pub static_mac: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PortMapping {
    pub host_ip: String,
    pub host_port: u16,
    pub container_port: u16,
    pub protocol: String,
    /// Number of consecutive ports mapped starting at the pair above.
    pub range: u16,
}

impl Default for PortMapping {
    fn default() -> Self {
        Self {
            host_ip: String::new(),
            host_port: 0,
            container_port: 0,
            protocol: "tcp".to_string(),
            range: 1,
        }
    }
}

/// Deprecated port-mapping shape kept only so old records deserialize.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LegacyPortMapping {
    pub proto: String,
    pub host: u16,
    pub container: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    pub test: Vec<String>,
    pub interval_secs: u64,
    pub timeout_secs: u64,
    pub start_period_secs: u64,
    pub retries: u32,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            test: Vec::new(),
            interval_secs: 30,
            timeout_secs: 30,
            start_period_secs: 0,
            retries: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HealthCheckStatus {
    #[default]
    None,
    Starting,
    Healthy,
    Unhealthy,
}

/// Immutable container configuration. Changed only through the rewrite paths
/// (migrations and rename), never by normal lifecycle operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerConfig {
    pub id: String,
    pub name: String,
    pub namespace: String,
    pub pod_id: Option<String>,

    /// Image-store layer backing the rootfs, or empty when `rootfs` is set.
    pub rootfs_image_id: String,
    pub rootfs_image_name: String,
    /// Direct path rootfs, bypassing the image store.
    pub rootfs: Option<PathBuf>,

    pub command: Vec<String>,
    pub entrypoint: Vec<String>,
    pub env: Vec<String>,
    pub working_dir: String,
    pub user: String,
    pub terminal: bool,
    pub open_stdin: bool,

    pub mounts: Vec<MountSpec>,
    pub named_volumes: Vec<NamedVolumeRef>,

    /// bridge, host, none, or slirp4netns. Only bridge-like modes allow
    /// connect/disconnect.
    pub network_mode: String,
    pub networks: HashMap<String, PerNetworkOptions>,
    pub port_mappings: Vec<PortMapping>,
    /// Deprecated; converted into `port_mappings` on read.
    pub legacy_port_mappings: Vec<LegacyPortMapping>,
    pub exposed_ports: HashMap<u16, Vec<String>>,

    pub health_check: Option<HealthCheckConfig>,
    pub startup_health_check: Option<HealthCheckConfig>,

    pub restart_policy: RestartPolicy,
    pub restart_retries: u32,

    pub cgroup_manager: CgroupManager,
    pub cgroup_parent: String,
    pub no_cgroups: bool,

    pub oci_runtime: String,
    pub lock_id: locks::LockId,

    pub created_time: DateTime<Utc>,
    pub stop_timeout: u32,
    pub stop_signal: u32,
    pub shm_size: i64,
    pub is_infra: bool,
    pub init_container_type: String,
    pub auto_remove: bool,
    /// File the front-end asked us to write the container ID into; deleted
    /// on removal.
    pub cid_file: Option<PathBuf>,

    /// Containers that must be running before this one starts.
    pub dependencies: Vec<String>,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            name: String::new(),
            namespace: String::new(),
            pod_id: None,
            rootfs_image_id: String::new(),
            rootfs_image_name: String::new(),
            rootfs: None,
            command: Vec::new(),
            entrypoint: Vec::new(),
            env: Vec::new(),
            working_dir: "/".to_string(),
            user: String::new(),
            terminal: false,
            open_stdin: false,
            mounts: Vec::new(),
            named_volumes: Vec::new(),
            network_mode: "bridge".to_string(),
            networks: HashMap::new(),
            port_mappings: Vec::new(),
            legacy_port_mappings: Vec::new(),
            exposed_ports: HashMap::new(),
            health_check: None,
            startup_health_check: None,
            restart_policy: RestartPolicy::No,
            restart_retries: 0,
            cgroup_manager: CgroupManager::Cgroupfs,
            cgroup_parent: String::new(),
            no_cgroups: false,
            oci_runtime: String::new(),
            lock_id: 0,
            created_time: Utc::now(),
            stop_timeout: 10,
            stop_signal: 15,
            shm_size: 64 * 1024 * 1024,
            is_infra: false,
            init_container_type: String::new(),
            auto_remove: false,
            cid_file: None,
            dependencies: Vec::new(),
        }
    }
}

impl ContainerConfig {
    /// Migrate deprecated fields in place. Returns true when the record
    /// changed and should be lazily rewritten to the store.
    pub fn migrate(&mut self) -> bool {
        let mut changed = false;
        if self.port_mappings.is_empty() && !self.legacy_port_mappings.is_empty() {
            self.port_mappings = self
                .legacy_port_mappings
                .drain(..)
                .map(|old| PortMapping {
                    host_ip: String::new(),
                    host_port: old.host,
                    container_port: old.container,
                    protocol: if old.proto.is_empty() {
                        "tcp".to_string()
                    } else {
                        old.proto
                    },
                    range: 1,
                })
                .collect();
            changed = true;
        }
        changed
    }
}

/// Live status of one attached network, as reported by the network backend.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkStatus {
    pub interface: String,
    pub addresses: Vec<String>,
    pub gateway: Option<String>,
    pub dns_servers: Vec<String>,
}

/// Mutable, persisted container state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerState {
    pub state: ContainerStatus,
    pub pid: i32,
    pub conmon_pid: i32,
    pub started_time: Option<DateTime<Utc>>,
    pub finished_time: Option<DateTime<Utc>>,
    /// -1 means no recorded exit.
    pub exit_code: i32,
    pub exited: bool,
    pub oom_killed: bool,
    pub error: String,
    pub stopped_by_user: bool,
    pub restart_count: u32,
    pub checkpointed: bool,

    pub mountpoint: String,
    pub mounted: bool,

    /// Path of the network namespace, empty when none is set up.
    pub net_ns: String,
    pub network_status: HashMap<String, NetworkStatus>,
    /// Files bind-mounted into the container (target path → host path).
    pub bind_mounts: HashMap<String, String>,

    /// Live exec session IDs → PIDs, mirrored from the exec registry.
    pub exec_sessions: HashMap<String, i32>,

    pub health_check_status: HealthCheckStatus,
}

impl Default for ContainerState {
    fn default() -> Self {
        Self {
            state: ContainerStatus::Configured,
            pid: 0,
            conmon_pid: 0,
            started_time: None,
            finished_time: None,
            exit_code: -1,
            exited: false,
            oom_killed: false,
            error: String::new(),
            stopped_by_user: false,
            restart_count: 0,
            checkpointed: false,
            mountpoint: String::new(),
            mounted: false,
            net_ns: String::new(),
            network_status: HashMap::new(),
            bind_mounts: HashMap::new(),
            exec_sessions: HashMap::new(),
            health_check_status: HealthCheckStatus::None,
        }
    }
}

impl ContainerState {
    /// Reset everything that cannot survive a reboot. Called during refresh
    /// while the engine holds the alive lock.
    pub fn reset_transient(&mut self) {
        if self.state.is_live() || self.state == ContainerStatus::Stopped {
            self.state = ContainerStatus::Configured;
        }
        self.pid = 0;
        self.conmon_pid = 0;
        self.mountpoint = String::new();
        self.mounted = false;
        self.net_ns = String::new();
        self.network_status.clear();
        self.bind_mounts.clear();
        self.exec_sessions.clear();
        self.health_check_status = HealthCheckStatus::None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip() {
        for status in [
            ContainerStatus::Configured,
            ContainerStatus::Created,
            ContainerStatus::Running,
            ContainerStatus::Paused,
            ContainerStatus::Stopping,
            ContainerStatus::Stopped,
            ContainerStatus::Exited,
            ContainerStatus::Removing,
        ] {
            let parsed: ContainerStatus = status.to_string().parse().unwrap();
            assert_eq!(parsed, status);
        }
        assert!("definitely-not-a-state".parse::<ContainerStatus>().is_err());
    }

    #[test]
    fn test_legacy_port_mapping_migration() {
        let mut config = ContainerConfig {
            legacy_port_mappings: vec![LegacyPortMapping {
                proto: String::new(),
                host: 8080,
                container: 80,
            }],
            ..Default::default()
        };
        assert!(config.migrate());
        assert_eq!(config.port_mappings.len(), 1);
        assert_eq!(config.port_mappings[0].host_port, 8080);
        assert_eq!(config.port_mappings[0].container_port, 80);
        assert_eq!(config.port_mappings[0].protocol, "tcp");
        assert!(config.legacy_port_mappings.is_empty());

        // Second migrate is a no-op.
        assert!(!config.migrate());
    }

    #[test]
    fn test_state_deserializes_with_missing_fields() {
        let state: ContainerState = serde_json::from_str(r#"{"state":"running","pid":42}"#).unwrap();
        assert_eq!(state.state, ContainerStatus::Running);
        assert_eq!(state.pid, 42);
        assert_eq!(state.exit_code, -1);
    }

    #[test]
    fn test_reset_transient() {
        let mut state = ContainerState {
            state: ContainerStatus::Running,
            pid: 100,
            conmon_pid: 99,
            mounted: true,
            net_ns: "/run/netns/x".to_string(),
            ..Default::default()
        };
        state.reset_transient();
        assert_eq!(state.state, ContainerStatus::Configured);
        assert_eq!(state.pid, 0);
        assert!(!state.mounted);
        assert!(state.net_ns.is_empty());
    }

    #[test]
    fn test_exited_state_survives_reset() {
        let mut state = ContainerState {
            state: ContainerStatus::Exited,
            exit_code: 3,
            exited: true,
            ..Default::default()
        };
        state.reset_transient();
        assert_eq!(state.state, ContainerStatus::Exited);
        assert_eq!(state.exit_code, 3);
    }
}
