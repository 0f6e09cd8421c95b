//! Pod entity — shared-namespace grouping of containers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What happens to the pod when its last non-infra container exits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExitPolicy {
    /// The pod keeps running (infra stays up).
    #[default]
    Continue,
    /// The pod is stopped.
    Stop,
}

/// Which namespaces the pod's containers share with the infra container.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SharedNamespaces {
    pub pid: bool,
    pub ipc: bool,
    pub net: bool,
    pub mount: bool,
    pub user: bool,
    pub uts: bool,
    pub cgroup: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PodConfig {
    pub id: String,
    pub name: String,
    pub namespace: String,
    pub created_time: DateTime<Utc>,

    pub cgroup_parent: String,
    /// Create a parent cgroup owned by the pod; containers nest under it.
    pub use_pod_cgroup: bool,

    pub shares: SharedNamespaces,
    pub restart_policy: super::RestartPolicy,
    pub exit_policy: ExitPolicy,

    pub has_infra: bool,
    pub lock_id: locks::LockId,
}

impl Default for PodConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            name: String::new(),
            namespace: String::new(),
            created_time: Utc::now(),
            cgroup_parent: String::new(),
            use_pod_cgroup: false,
            shares: SharedNamespaces {
                // Matching the conventional default share set.
                ipc: true,
                net: true,
                uts: true,
                ..Default::default()
            },
            restart_policy: super::RestartPolicy::No,
            exit_policy: ExitPolicy::Continue,
            has_infra: true,
            lock_id: 0,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PodState {
    /// Cgroup path created for the pod, when `use_pod_cgroup` is set.
    pub cgroup_path: String,
    pub infra_container_id: Option<String>,
}

impl PodState {
    /// Drop state that does not survive a reboot. The cgroup path is
    /// rebuilt by refresh once the cgroup parent exists again.
    pub fn reset_transient(&mut self) {
        self.cgroup_path = String::new();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_shares() {
        let config = PodConfig::default();
        assert!(config.shares.ipc);
        assert!(config.shares.net);
        assert!(config.shares.uts);
        assert!(!config.shares.pid);
    }

    #[test]
    fn test_state_round_trip() {
        let state = PodState {
            cgroup_path: "/engine/pod-abc".to_string(),
            infra_container_id: Some("deadbeef".to_string()),
        };
        let json = serde_json::to_string(&state).unwrap();
        let back: PodState = serde_json::from_str(&json).unwrap();
        assert_eq!(back.cgroup_path, state.cgroup_path);
        assert_eq!(back.infra_container_id, state.infra_container_id);
    }
}
