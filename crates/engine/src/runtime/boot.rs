//! Boot — engine bootstrap, the alive lock, and refresh-on-reboot.
//!
//! Bootstrap order: resolve config, ensure directories, take the alive
//! lock, open the state store, reconcile the stored runtime-config record,
//! open the lock manager, build the OCI runtime table, compare boot IDs
//! (refreshing when they differ), start the worker queue, release the
//! alive lock.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use fs2::FileExt;

use crate::conf::{self, ConfigOverrides, EngineConfig, LockBackend, StateBackend};
use crate::ctr::Container;
use crate::entity::ContainerStatus;
use crate::errors::EngineError;
use crate::events::{eventer_for, EventKind, EventStatus, Eventer};
use crate::net::helper::HelperBackend;
use crate::net::NetworkBackend;
use crate::oci::{ConmonRuntime, MissingRuntime, OciRuntime};
use crate::state::{KvState, SqlState, StateStore};
use crate::volume::DriverRegistry;

use super::{worker::Worker, Engine, EngineInner};

/// Name of the alive lock file inside the tmp dir.
pub const ALIVE_LOCK: &str = "alive.lck";
/// Name of the per-boot marker file inside the tmp dir.
pub const ALIVE_MARKER: &str = "alive";

/// Exclusive cross-process lock held while an engine instance initializes.
pub(crate) struct AliveLock {
    file: std::fs::File,
}

impl AliveLock {
    pub(crate) fn acquire(tmp_dir: &Path) -> Result<Self, EngineError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(tmp_dir.join(ALIVE_LOCK))?;
        file.lock_exclusive()?;
        Ok(AliveLock { file })
    }
}

impl Drop for AliveLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

/// Identifier for the current boot, from the kernel when available.
pub fn boot_id() -> String {
    match std::fs::read_to_string("/proc/sys/kernel/random/boot_id") {
        Ok(id) => id.trim().to_string(),
        Err(_) => "unknown-boot".to_string(),
    }
}

/// First existing conmon candidate, falling back to the first entry.
pub(crate) fn find_conmon(config: &EngineConfig) -> PathBuf {
    for candidate in &config.conmon_paths {
        if candidate.exists() {
            return candidate.clone();
        }
    }
    config
        .conmon_paths
        .first()
        .cloned()
        .unwrap_or_else(|| PathBuf::from("conmon"))
}

fn ensure_dir_0700(path: &Path) -> Result<(), EngineError> {
    if !path.exists() {
        std::fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(path)?;
    }
    Ok(())
}

pub struct EngineBuilder {
    overrides: ConfigOverrides,
    config: Option<EngineConfig>,
    network: Option<Arc<dyn NetworkBackend>>,
    oci_runtimes: Option<HashMap<String, Arc<dyn OciRuntime>>>,
    eventer: Option<Box<dyn Eventer>>,
}

impl EngineBuilder {
    pub fn new() -> Self {
        EngineBuilder {
            overrides: ConfigOverrides::default(),
            config: None,
            network: None,
            oci_runtimes: None,
            eventer: None,
        }
    }

    pub fn overrides(mut self, overrides: ConfigOverrides) -> Self {
        self.overrides = overrides;
        self
    }

    /// Use an explicit config instead of the file/env merge. Tests and
    /// embedded callers use this for full isolation.
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn network_backend(mut self, backend: Arc<dyn NetworkBackend>) -> Self {
        self.network = Some(backend);
        self
    }

    /// Replace the configured OCI runtime table, e.g. with a test fake. The
    /// map must contain the config's default runtime name.
    pub fn oci_runtimes(mut self, runtimes: HashMap<String, Arc<dyn OciRuntime>>) -> Self {
        self.oci_runtimes = Some(runtimes);
        self
    }

    pub fn eventer(mut self, eventer: Box<dyn Eventer>) -> Self {
        self.eventer = Some(eventer);
        self
    }

    pub async fn build(self) -> Result<Engine, EngineError> {
        let mut config = match self.config {
            Some(config) => config,
            None => conf::load().map_err(|e| EngineError::InvalidArg(e.to_string()))?,
        };
        self.overrides.apply(&mut config);
        config
            .validate()
            .map_err(EngineError::InvalidArg)?;

        ensure_dir_0700(&config.static_dir)?;
        ensure_dir_0700(&config.tmp_dir)?;
        ensure_dir_0700(&config.volume_path)?;
        std::fs::create_dir_all(&config.run_root)?;
        std::fs::create_dir_all(&config.graph_root)?;

        // Exclusive while we initialize; also guards refresh.
        let alive = AliveLock::acquire(&config.tmp_dir)?;

        let store: Box<dyn StateStore> = match resolve_backend(&config) {
            StateBackend::Kv => Box::new(KvState::open(&config.static_dir)?),
            _ => Box::new(SqlState::open(&config.static_dir).await?),
        };

        // The database remembers the layout it was created under; recorded
        // values win unless the caller explicitly overrode them.
        let stored = store.db_config().await?;
        adopt_stored_paths(&mut config, &self.overrides, &stored);
        store.validate_db_config(&config, self.overrides.reset).await?;

        let lock_manager: Box<dyn locks::LockManager> = match config.lock_backend {
            LockBackend::Shm => Box::new(
                locks::ShmLockManager::create(config.lock_pool_path(), config.num_locks).map_err(
                    |e| match e {
                        locks::LockError::CountMismatch { expected, actual } => {
                            EngineError::Internal(format!(
                                "lock pool holds {} locks but configuration requests {}; run a lock renumber",
                                actual, expected
                            ))
                        }
                        other => other.into(),
                    },
                )?,
            ),
            LockBackend::File => Box::new(locks::FileLockManager::create(
                config.lock_pool_path(),
                config.num_locks,
            )?),
        };

        let oci_runtimes = match self.oci_runtimes {
            Some(table) => table,
            None => build_runtime_table(&config)?,
        };
        let default_runtime_name = config.default_runtime.clone();
        if !oci_runtimes.contains_key(&default_runtime_name)
            && !default_runtime_name.starts_with('/')
        {
            return Err(EngineError::OCIRuntimeNotFound(default_runtime_name));
        }

        let network: Arc<dyn NetworkBackend> = match self.network {
            Some(backend) => backend,
            None => Arc::new(HelperBackend::new(config.network_helper.clone())),
        };

        let eventer = match self.eventer {
            Some(eventer) => eventer,
            None => eventer_for(&config.events_backend, config.events_log_path.clone()),
        };

        let volume_drivers = DriverRegistry::new(config.volume_path.clone());

        let inner = Arc::new(EngineInner {
            volume_drivers,
            store,
            lock_manager,
            oci_runtimes,
            default_runtime_name,
            network,
            eventer,
            workers: Worker::start(),
            port_reservations: dashmap::DashMap::new(),
            ad_hoc_runtimes: dashmap::DashMap::new(),
            valid: AtomicBool::new(true),
            prune_task: parking_lot::Mutex::new(None),
            config,
        });
        let engine = Engine {
            inner: Arc::clone(&inner),
        };

        // A changed (or missing) boot ID means the host rebooted since the
        // last engine ran here: transient state is stale and must go.
        let marker = inner.config.tmp_dir.join(ALIVE_MARKER);
        let current_boot = boot_id();
        let recorded = std::fs::read_to_string(&marker).ok();
        if recorded.as_deref().map(str::trim) != Some(current_boot.as_str()) {
            tracing::info!(
                recorded = recorded.as_deref().unwrap_or("<none>"),
                current = current_boot.as_str(),
                "boot ID changed; refreshing engine state"
            );
            engine.refresh().await?;
        }
        std::fs::write(&marker, &current_boot)?;

        inner.start_prune_timer();
        drop(alive);
        tracing::info!(
            static_dir = %engine.config().static_dir.display(),
            "engine initialized"
        );
        Ok(engine)
    }
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolve the "default" backend choice: an existing KV database wins,
/// otherwise the relational backend.
fn resolve_backend(config: &EngineConfig) -> StateBackend {
    match config.state_backend {
        StateBackend::Default => {
            if KvState::exists(&config.static_dir) {
                StateBackend::Kv
            } else {
                StateBackend::Sqlite
            }
        }
        explicit => explicit,
    }
}

fn adopt_stored_paths(
    config: &mut EngineConfig,
    overrides: &ConfigOverrides,
    stored: &crate::state::DBConfig,
) {
    if overrides.static_dir.is_none() {
        if let Some(v) = &stored.static_dir {
            config.static_dir = PathBuf::from(v);
        }
    }
    if overrides.tmp_dir.is_none() {
        if let Some(v) = &stored.tmp_dir {
            config.tmp_dir = PathBuf::from(v);
        }
    }
    if overrides.run_root.is_none() {
        if let Some(v) = &stored.run_root {
            config.run_root = PathBuf::from(v);
        }
    }
    if overrides.graph_root.is_none() {
        if let Some(v) = &stored.graph_root {
            config.graph_root = PathBuf::from(v);
        }
    }
    if overrides.graph_driver_name.is_none() {
        if let Some(v) = &stored.graph_driver {
            config.graph_driver_name = v.clone();
        }
    }
    if overrides.volume_path.is_none() {
        if let Some(v) = &stored.volume_path {
            config.volume_path = PathBuf::from(v);
        }
    }
}

fn build_runtime_table(
    config: &EngineConfig,
) -> Result<HashMap<String, Arc<dyn OciRuntime>>, EngineError> {
    let conmon = find_conmon(config);
    let mut table: HashMap<String, Arc<dyn OciRuntime>> = HashMap::new();
    for (name, candidates) in &config.oci_runtimes {
        let binary = candidates.iter().find(|p| p.exists());
        let runtime: Arc<dyn OciRuntime> = match binary {
            Some(path) => Arc::new(ConmonRuntime::new(
                name.clone(),
                path.clone(),
                conmon.clone(),
                config.run_root.clone(),
                config.tmp_dir.clone(),
            )?),
            None => {
                tracing::debug!(runtime = name.as_str(), "no binary found, registering missing-runtime proxy");
                Arc::new(MissingRuntime::new(name.clone()))
            }
        };
        table.insert(name.clone(), runtime);
    }
    Ok(table)
}

impl Engine {
    /// Clear state that cannot survive a reboot and re-seat every entity's
    /// lock. Must run with no other engine instance alive (the caller holds
    /// the alive lock, or exclusive access is otherwise guaranteed).
    pub async fn refresh(&self) -> Result<(), EngineError> {
        self.inner.store.refresh().await?;

        // Re-seat locks recorded in the database into the (possibly fresh)
        // pool. An index already taken is fine: the pool survived.
        for (kind, id, lock_id) in self.inner.store.all_lock_ids().await? {
            match self.inner.lock_manager.allocate_at(lock_id) {
                Ok(()) | Err(locks::LockError::LockTaken(_)) => {}
                Err(e) => {
                    tracing::error!(
                        kind = kind.as_str(),
                        id = id.as_str(),
                        lock = lock_id,
                        error = %e,
                        "cannot restore entity lock; a renumber is required"
                    );
                }
            }
        }

        // Containers that were mid-removal, or exited auto-remove
        // containers, do not survive a reboot.
        for (config, state) in self.inner.store.all_containers().await? {
            let doomed = state.state == ContainerStatus::Removing
                || (config.auto_remove && state.state == ContainerStatus::Exited);
            if doomed {
                match Container::load(Arc::clone(&self.inner), &config.id).await {
                    Ok(handle) => {
                        if let Err(e) = self
                            .remove_container(
                                &handle,
                                crate::runtime::ctr::RemoveOptions {
                                    force: true,
                                    remove_volumes: true,
                                    ..Default::default()
                                },
                            )
                            .await
                        {
                            if !e.is_idempotent_success() {
                                tracing::error!(ctr = config.id.as_str(), error = %e, "failed to remove container during refresh");
                            }
                        }
                    }
                    Err(e) => {
                        tracing::error!(ctr = config.id.as_str(), error = %e, "cannot load container doomed at refresh");
                    }
                }
            }
        }

        // Pods rebuild their cgroup parent lazily; record the expected path.
        for (config, mut state) in self.inner.store.all_pods().await? {
            if config.use_pod_cgroup {
                state.cgroup_path = format!("{}/{}", config.cgroup_parent, config.id);
                self.inner.store.save_pod(&config.id, &state).await?;
            }
        }

        self.inner
            .event(EventKind::System, EventStatus::Refresh, "", "engine")
            .await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_boot_id_stable() {
        let first = boot_id();
        assert!(!first.is_empty());
        assert_eq!(first, boot_id());
    }

    #[test]
    fn test_resolve_backend_prefers_existing_kv() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut config = EngineConfig {
            static_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        config.state_backend = StateBackend::Default;
        assert_eq!(resolve_backend(&config), StateBackend::Sqlite);

        std::fs::create_dir_all(dir.path().join(crate::state::kv::KV_DB_FILE)).unwrap();
        assert_eq!(resolve_backend(&config), StateBackend::Kv);
    }
}
