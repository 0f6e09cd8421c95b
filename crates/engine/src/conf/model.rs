//! Model — EngineConfig and related structs.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Which state store implementation backs the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StateBackend {
    /// Resolved at bootstrap: the KV file if one already exists, else sqlite.
    #[default]
    Default,
    Kv,
    Sqlite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LockBackend {
    #[default]
    Shm,
    File,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Persistent engine state: database file, file-backed locks.
    pub static_dir: PathBuf,
    /// Per-boot state: alive lock, exit files, conmon pidfiles.
    pub tmp_dir: PathBuf,
    /// Runtime root handed to the OCI runtime.
    pub run_root: PathBuf,
    /// Graph-driver storage root.
    pub graph_root: PathBuf,
    pub graph_driver_name: String,
    /// Root for named volume payloads (`<volume_path>/<name>/_data`).
    pub volume_path: PathBuf,

    pub state_backend: StateBackend,
    pub lock_backend: LockBackend,
    pub num_locks: u32,

    /// OCI runtime name → candidate binary paths, first hit wins.
    pub oci_runtimes: HashMap<String, Vec<PathBuf>>,
    pub default_runtime: String,
    /// Candidate paths for the conmon-compatible monitor binary.
    pub conmon_paths: Vec<PathBuf>,

    pub events_backend: String,
    pub events_log_path: PathBuf,

    /// Helper binary implementing the network backend protocol.
    pub network_helper: PathBuf,
    /// Name interfaces after the network driver instead of synthesizing ethN.
    pub interface_naming_by_driver: bool,
    pub default_network: String,

    /// Default seconds to wait between SIGTERM and SIGKILL on stop.
    pub stop_timeout: u32,
    /// Namespace new entities are created in when the caller passes none.
    pub namespace: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let rootless = !nix::unistd::geteuid().is_root();
        let (static_dir, tmp_dir, graph_root, run_root) = if rootless {
            let data = std::env::var("XDG_DATA_HOME")
                .map(PathBuf::from)
                .unwrap_or_else(|_| {
                    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
                    PathBuf::from(home).join(".local/share")
                });
            let run = std::env::var("XDG_RUNTIME_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("/tmp"));
            (
                data.join("engine/state"),
                run.join("engine/tmp"),
                data.join("engine/storage"),
                run.join("engine"),
            )
        } else {
            (
                PathBuf::from("/var/lib/engine/state"),
                PathBuf::from("/run/engine/tmp"),
                PathBuf::from("/var/lib/engine/storage"),
                PathBuf::from("/run/engine"),
            )
        };

        let mut oci_runtimes = HashMap::new();
        oci_runtimes.insert(
            "crun".to_string(),
            vec![
                PathBuf::from("/usr/bin/crun"),
                PathBuf::from("/usr/local/bin/crun"),
            ],
        );
        oci_runtimes.insert(
            "runc".to_string(),
            vec![
                PathBuf::from("/usr/bin/runc"),
                PathBuf::from("/usr/sbin/runc"),
                PathBuf::from("/usr/local/bin/runc"),
            ],
        );

        let volume_path = graph_root.join("volumes");
        let events_log_path = tmp_dir.join("events.log");
        Self {
            static_dir,
            tmp_dir,
            run_root,
            graph_root,
            graph_driver_name: "overlay".to_string(),
            volume_path,
            state_backend: StateBackend::Default,
            lock_backend: LockBackend::Shm,
            num_locks: locks::DEFAULT_LOCK_COUNT,
            oci_runtimes,
            default_runtime: "crun".to_string(),
            conmon_paths: vec![
                PathBuf::from("/usr/bin/conmon"),
                PathBuf::from("/usr/libexec/crio/conmon"),
                PathBuf::from("/usr/local/bin/conmon"),
            ],
            events_backend: "file".to_string(),
            events_log_path,
            network_helper: PathBuf::from("/usr/bin/netavark"),
            interface_naming_by_driver: false,
            default_network: "bridge".to_string(),
            stop_timeout: 10,
            namespace: String::new(),
        }
    }
}

impl EngineConfig {
    /// Validate configuration values (fast, no I/O).
    pub fn validate(&self) -> Result<(), String> {
        if self.num_locks == 0 {
            return Err("num_locks must be > 0".to_string());
        }
        if self.default_runtime.is_empty() {
            return Err("default_runtime must not be empty".to_string());
        }
        if !self.default_runtime.starts_with('/')
            && !self.oci_runtimes.contains_key(&self.default_runtime)
        {
            return Err(format!(
                "default_runtime \"{}\" is not in the oci_runtimes table",
                self.default_runtime
            ));
        }
        match self.events_backend.as_str() {
            "file" | "memory" | "journald" | "none" => {}
            other => return Err(format!("unknown events backend \"{}\"", other)),
        }
        Ok(())
    }

    pub fn rootless(&self) -> bool {
        !nix::unistd::geteuid().is_root()
    }

    /// Path of the shm lock pool / file lock directory for this instance.
    pub fn lock_pool_path(&self) -> PathBuf {
        match self.lock_backend {
            LockBackend::Shm => {
                let uid = nix::unistd::geteuid().as_raw();
                PathBuf::from(format!("/dev/shm/engine_locks_{}", uid))
            }
            LockBackend::File => self.static_dir.join("locks"),
        }
    }
}

/// Caller-supplied overrides, applied last in the merge order. A `Some`
/// field counts as "explicitly set by the caller" and beats the value
/// recorded in the database at validation time.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub static_dir: Option<PathBuf>,
    pub tmp_dir: Option<PathBuf>,
    pub run_root: Option<PathBuf>,
    pub graph_root: Option<PathBuf>,
    pub graph_driver_name: Option<String>,
    pub volume_path: Option<PathBuf>,
    pub state_backend: Option<StateBackend>,
    pub num_locks: Option<u32>,
    /// Reset mode: path divergence downgrades to a warning.
    pub reset: bool,
}

impl ConfigOverrides {
    pub fn apply(&self, config: &mut EngineConfig) {
        if let Some(v) = &self.static_dir {
            config.static_dir = v.clone();
        }
        if let Some(v) = &self.tmp_dir {
            config.tmp_dir = v.clone();
        }
        if let Some(v) = &self.run_root {
            config.run_root = v.clone();
        }
        if let Some(v) = &self.graph_root {
            config.graph_root = v.clone();
            config.volume_path = v.join("volumes");
        }
        if let Some(v) = &self.graph_driver_name {
            config.graph_driver_name = v.clone();
        }
        if let Some(v) = &self.volume_path {
            config.volume_path = v.clone();
        }
        if let Some(v) = self.state_backend {
            config.state_backend = v;
        }
        if let Some(v) = self.num_locks {
            config.num_locks = v;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_unknown_default_runtime_rejected() {
        let mut config = EngineConfig::default();
        config.default_runtime = "kata".to_string();
        assert!(config.validate().is_err());

        // Absolute paths are allowed ad hoc without a table entry.
        config.default_runtime = "/usr/bin/kata-runtime".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_overrides_follow_graph_root() {
        let mut config = EngineConfig::default();
        let overrides = ConfigOverrides {
            graph_root: Some(PathBuf::from("/srv/engine")),
            ..Default::default()
        };
        overrides.apply(&mut config);
        assert_eq!(config.graph_root, PathBuf::from("/srv/engine"));
        assert_eq!(config.volume_path, PathBuf::from("/srv/engine/volumes"));
    }
}
