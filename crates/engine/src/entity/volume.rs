//! Volume entity — named volumes, anonymous volumes, driver-backed volumes.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumeConfig {
    /// Unique across all volumes. Anonymous volumes get a generated hex name.
    pub name: String,
    pub driver: String,
    pub options: HashMap<String, String>,
    pub labels: HashMap<String, String>,
    pub created_time: DateTime<Utc>,

    /// `<volume_path>/<name>/_data` for the local driver.
    pub mount_point: String,
    pub uid: u32,
    pub gid: u32,

    pub is_anon: bool,
    /// Image-store container ID backing an image-backed pseudo-volume.
    pub storage_id: String,
    /// Driver call timeout override, seconds.
    pub timeout: Option<u64>,
    pub lock_id: locks::LockId,
}

impl Default for VolumeConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            driver: "local".to_string(),
            options: HashMap::new(),
            labels: HashMap::new(),
            created_time: Utc::now(),
            mount_point: String::new(),
            uid: 0,
            gid: 0,
            is_anon: false,
            storage_id: String::new(),
            timeout: None,
            lock_id: 0,
        }
    }
}

impl VolumeConfig {
    /// True when a driver plug-in (not the built-in local driver) backs this
    /// volume.
    pub fn uses_plugin(&self) -> bool {
        !self.driver.is_empty() && self.driver != "local"
    }
}

/// Mutable volume state. Absent in records written before volume state
/// existed; treated as the zero value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumeState {
    /// Copy image contents into the volume on first mount.
    pub needs_copy_up: bool,
    /// Chown the mount point to the container user on first use.
    pub needs_chown: bool,
    /// Number of live mounts; unmount only when this drops to zero.
    pub mount_count: u32,
    /// Driver-reported mount point, which may differ from the config's.
    pub mount_point: String,
}

impl VolumeState {
    pub fn reset_transient(&mut self) {
        self.mount_count = 0;
        self.mount_point = String::new();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_state_is_zero_value() {
        let state: VolumeState = serde_json::from_str("{}").unwrap();
        assert_eq!(state.mount_count, 0);
        assert!(!state.needs_copy_up);
    }

    #[test]
    fn test_plugin_detection() {
        let mut config = VolumeConfig::default();
        assert!(!config.uses_plugin());
        config.driver = "nfs".to_string();
        assert!(config.uses_plugin());
    }
}
