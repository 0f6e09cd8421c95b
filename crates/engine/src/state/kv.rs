//! KV state backend — sled database with nested buckets emulated by key
//! prefixes.
//!
//! Bucket names are fixed for compatibility with existing datasets. A
//! per-entity "sub-bucket" is the set of keys `<id>/<suffix>` inside the
//! entity's tree. The store is single-writer: every mutating operation runs
//! under one process-local mutex, validates all preconditions before its
//! first write, and flushes before returning. Mid-write failure is therefore
//! limited to I/O faults, which are surfaced untouched and repaired lazily
//! on later reads where possible.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use sled::Tree;

use crate::conf::EngineConfig;
use crate::entity::{
    ContainerConfig, ContainerState, ExecSession, PerNetworkOptions, PodConfig, PodState,
    VolumeConfig, VolumeState,
};
use crate::errors::EngineError;
use crate::util::now_unix;

use super::dbconfig::{self, DBConfig};
use super::{check_exit_code, lookup_failure, match_prefix, PrefixMatch, StateStore};

/// Database file inside the static dir.
pub const KV_DB_FILE: &str = "kv_state.db";

// Bucket names, exact.
const BKT_ID_REGISTRY: &str = "id-registry";
const BKT_NAME_REGISTRY: &str = "name-registry";
const BKT_CTR: &str = "ctr";
const BKT_ALL_CTRS: &str = "all-ctrs";
const BKT_POD: &str = "pod";
const BKT_ALL_PODS: &str = "allPods";
const BKT_VOL: &str = "vol";
const BKT_ALL_VOLUMES: &str = "allVolumes";
const BKT_EXEC: &str = "exec";
const BKT_RUNTIME_CONFIG: &str = "runtime-config";
const BKT_VOLUME_CTRS: &str = "volume-ctrs";
const BKT_EXIT_CODE: &str = "exit-code";
const BKT_EXIT_CODE_TS: &str = "exit-code-time-stamp";

// Per-entity key suffixes.
const KEY_CONFIG: &str = "config";
const KEY_STATE: &str = "state";
const KEY_POD_ID: &str = "pod-id";
const KEY_DEPENDENCIES: &str = "dependencies";
const KEY_NETWORKS: &str = "networks";
const KEY_CONTAINERS: &str = "containers";
/// Legacy location of the network-namespace path, predating the state field.
const KEY_LEGACY_NETNS: &str = "netns";

pub struct KvState {
    db: sled::Db,
    id_registry: Tree,
    name_registry: Tree,
    ctrs: Tree,
    all_ctrs: Tree,
    pods: Tree,
    all_pods: Tree,
    vols: Tree,
    all_volumes: Tree,
    execs: Tree,
    runtime_config: Tree,
    volume_ctrs: Tree,
    exit_codes: Tree,
    exit_code_times: Tree,
    /// Single-writer gate; no mutating operation runs concurrently.
    write_lock: Mutex<()>,
    closed: AtomicBool,
}

fn sub_key(id: &str, suffix: &str) -> Vec<u8> {
    format!("{}/{}", id, suffix).into_bytes()
}

fn sub_prefix(id: &str, suffix: &str) -> Vec<u8> {
    format!("{}/{}/", id, suffix).into_bytes()
}

fn ivec_str(v: &sled::IVec) -> String {
    String::from_utf8_lossy(v).into_owned()
}

impl KvState {
    /// Open (or create) the KV database inside `static_dir`.
    pub fn open(static_dir: &Path) -> Result<Self, EngineError> {
        let db = sled::open(static_dir.join(KV_DB_FILE))?;
        Ok(KvState {
            id_registry: db.open_tree(BKT_ID_REGISTRY)?,
            name_registry: db.open_tree(BKT_NAME_REGISTRY)?,
            ctrs: db.open_tree(BKT_CTR)?,
            all_ctrs: db.open_tree(BKT_ALL_CTRS)?,
            pods: db.open_tree(BKT_POD)?,
            all_pods: db.open_tree(BKT_ALL_PODS)?,
            vols: db.open_tree(BKT_VOL)?,
            all_volumes: db.open_tree(BKT_ALL_VOLUMES)?,
            execs: db.open_tree(BKT_EXEC)?,
            runtime_config: db.open_tree(BKT_RUNTIME_CONFIG)?,
            volume_ctrs: db.open_tree(BKT_VOLUME_CTRS)?,
            exit_codes: db.open_tree(BKT_EXIT_CODE)?,
            exit_code_times: db.open_tree(BKT_EXIT_CODE_TS)?,
            db,
            write_lock: Mutex::new(()),
            closed: AtomicBool::new(false),
        })
    }

    /// True when a KV database file already exists under `static_dir`.
    /// Bootstrap uses this to resolve the "default" backend choice.
    pub fn exists(static_dir: &Path) -> bool {
        static_dir.join(KV_DB_FILE).exists()
    }

    fn check_open(&self) -> Result<(), EngineError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EngineError::DBClosed);
        }
        Ok(())
    }

    fn flush(&self) -> Result<(), EngineError> {
        self.db.flush()?;
        Ok(())
    }

    fn ctr_exists(&self, id: &str) -> Result<bool, EngineError> {
        Ok(self.ctrs.get(sub_key(id, KEY_CONFIG))?.is_some())
    }

    fn pod_exists(&self, id: &str) -> Result<bool, EngineError> {
        Ok(self.pods.get(sub_key(id, KEY_CONFIG))?.is_some())
    }

    /// Parse a container config, migrating deprecated fields in memory.
    /// Safe to call while the write lock is held; never persists.
    fn read_ctr_config(&self, id: &str) -> Result<(ContainerConfig, bool), EngineError> {
        let raw = self
            .ctrs
            .get(sub_key(id, KEY_CONFIG))?
            .ok_or_else(|| EngineError::NoSuchCtr(id.to_string()))?;
        let mut config: ContainerConfig = serde_json::from_slice(&raw)?;
        let migrated = config.migrate();
        Ok((config, migrated))
    }

    /// Read path for callers outside the write lock: migrated records are
    /// lazily rewritten. Failure to persist is non-fatal; the migration
    /// simply runs again on the next read.
    fn load_ctr_config(&self, id: &str) -> Result<ContainerConfig, EngineError> {
        let (config, migrated) = self.read_ctr_config(id)?;
        if migrated {
            let _w = self.write_lock.lock();
            if let Err(e) = self
                .ctrs
                .insert(sub_key(id, KEY_CONFIG), serde_json::to_vec(&config)?)
            {
                tracing::warn!(ctr = id, error = %e, "failed to persist migrated container config");
            }
        }
        Ok(config)
    }

    fn load_ctr_state(&self, id: &str) -> Result<ContainerState, EngineError> {
        let raw = self
            .ctrs
            .get(sub_key(id, KEY_STATE))?
            .ok_or_else(|| EngineError::NoSuchCtr(id.to_string()))?;
        let mut state: ContainerState = serde_json::from_slice(&raw)?;
        // The state-embedded value is canonical; the legacy key is consulted
        // only when the state carries nothing.
        if state.net_ns.is_empty() {
            if let Some(legacy) = self.ctrs.get(sub_key(id, KEY_LEGACY_NETNS))? {
                state.net_ns = ivec_str(&legacy);
            }
        }
        Ok(state)
    }

    /// Reject a new entity name/ID that clashes with the container/pod
    /// union, distinguishing which kind owns the clash.
    fn check_registry_free(&self, id: &str, name: &str) -> Result<(), EngineError> {
        if self.id_registry.get(id)?.is_some() {
            return Err(if self.pod_exists(id)? {
                EngineError::PodExists(id.to_string())
            } else {
                EngineError::CtrExists(id.to_string())
            });
        }
        if let Some(taken_by) = self.name_registry.get(name)? {
            let owner = ivec_str(&taken_by);
            return Err(if self.pod_exists(&owner)? {
                EngineError::PodExists(name.to_string())
            } else {
                EngineError::CtrExists(name.to_string())
            });
        }
        Ok(())
    }

    fn add_container_inner(
        &self,
        pod_id: Option<&str>,
        config: &ContainerConfig,
        state: &ContainerState,
    ) -> Result<(), EngineError> {
        self.check_open()?;
        let _w = self.write_lock.lock();

        // Validate everything before the first write.
        self.check_registry_free(&config.id, &config.name)?;

        if let Some(pod) = pod_id {
            if !self.pod_exists(pod)? {
                return Err(EngineError::NoSuchPod(pod.to_string()));
            }
        }

        for dep in &config.dependencies {
            if !self.ctr_exists(dep)? {
                return Err(EngineError::NoSuchCtr(dep.to_string()));
            }
            let dep_pod = self
                .ctrs
                .get(sub_key(dep, KEY_POD_ID))?
                .map(|v| ivec_str(&v));
            if dep_pod.as_deref() != pod_id {
                return Err(EngineError::InvalidArg(format!(
                    "container {} depends on {}, which is in a different pod",
                    config.id, dep
                )));
            }
        }

        for vol in &config.named_volumes {
            if self.vols.get(sub_key(&vol.name, KEY_CONFIG))?.is_none() {
                return Err(EngineError::NoSuchVolume(vol.name.clone()));
            }
        }

        // Writes, in registry → record → edges order.
        self.id_registry.insert(config.id.as_str(), config.name.as_str())?;
        self.name_registry.insert(config.name.as_str(), config.id.as_str())?;
        self.all_ctrs.insert(config.id.as_str(), config.name.as_str())?;
        self.ctrs
            .insert(sub_key(&config.id, KEY_CONFIG), serde_json::to_vec(config)?)?;
        self.ctrs
            .insert(sub_key(&config.id, KEY_STATE), serde_json::to_vec(state)?)?;
        if let Some(pod) = pod_id {
            self.ctrs.insert(sub_key(&config.id, KEY_POD_ID), pod)?;
            let member_key = format!("{}/{}/{}", pod, KEY_CONTAINERS, config.id);
            self.pods.insert(member_key.as_bytes(), config.id.as_str())?;
        }
        for (net, opts) in &config.networks {
            let key = format!("{}/{}/{}", config.id, KEY_NETWORKS, net);
            self.ctrs.insert(key.as_bytes(), serde_json::to_vec(opts)?)?;
        }
        for dep in &config.dependencies {
            let key = format!("{}/{}/{}", dep, KEY_DEPENDENCIES, config.id);
            self.ctrs.insert(key.as_bytes(), config.id.as_str())?;
        }
        for vol in &config.named_volumes {
            let key = format!("{}/{}", vol.name, config.id);
            self.volume_ctrs.insert(key.as_bytes(), config.id.as_str())?;
        }
        self.flush()
    }

    fn remove_container_inner(&self, pod_id: Option<&str>, id: &str) -> Result<(), EngineError> {
        self.check_open()?;
        let _w = self.write_lock.lock();

        let (config, _) = self.read_ctr_config(id)?;

        let stored_pod = self.ctrs.get(sub_key(id, KEY_POD_ID))?.map(|v| ivec_str(&v));
        match (pod_id, stored_pod.as_deref()) {
            (None, Some(pod)) => {
                return Err(EngineError::InvalidArg(format!(
                    "container {} is a member of pod {}, remove it through the pod",
                    id, pod
                )))
            }
            (Some(requested), stored) if stored != Some(requested) => {
                return Err(EngineError::InvalidArg(format!(
                    "container {} is not a member of pod {}",
                    id, requested
                )))
            }
            _ => {}
        }

        // Live exec sessions and dependent containers block removal.
        let mut sessions = Vec::new();
        for item in self.execs.iter() {
            let (key, raw) = item?;
            let session: ExecSession = serde_json::from_slice(&raw)?;
            if session.container_id == id {
                sessions.push(ivec_str(&key));
            }
        }
        if !sessions.is_empty() {
            return Err(EngineError::Internal(format!(
                "container {} has active exec sessions: {}",
                id,
                sessions.join(", ")
            )));
        }

        let dependents = self.scan_sub_ids(&self.ctrs, id, KEY_DEPENDENCIES)?;
        if !dependents.is_empty() {
            return Err(EngineError::DepExists {
                id: id.to_string(),
                deps: dependents.join(", "),
            });
        }

        if let Some(pod) = pod_id {
            let member_key = format!("{}/{}/{}", pod, KEY_CONTAINERS, id);
            self.pods.remove(member_key.as_bytes())?;
        }

        // Delete the per-container sub-bucket wholesale.
        let prefix = format!("{}/", id);
        let keys: Vec<sled::IVec> = self
            .ctrs
            .scan_prefix(prefix.as_bytes())
            .keys()
            .collect::<Result<_, _>>()?;
        for key in keys {
            self.ctrs.remove(key)?;
        }

        self.id_registry.remove(id)?;
        self.name_registry.remove(config.name.as_str())?;
        self.all_ctrs.remove(id)?;

        // Back-edges; missing edges are logged, not fatal.
        for dep in &config.dependencies {
            let key = format!("{}/{}/{}", dep, KEY_DEPENDENCIES, id);
            if self.ctrs.remove(key.as_bytes())?.is_none() {
                tracing::warn!(
                    ctr = id,
                    dependency = dep.as_str(),
                    "dependency back-edge already missing during removal"
                );
            }
        }

        // Volume references; a missing volume is not an error.
        for vol in &config.named_volumes {
            let key = format!("{}/{}", vol.name, id);
            self.volume_ctrs.remove(key.as_bytes())?;
        }

        self.flush()
    }

    fn scan_sub_ids(
        &self,
        tree: &Tree,
        id: &str,
        suffix: &str,
    ) -> Result<Vec<String>, EngineError> {
        let prefix = sub_prefix(id, suffix);
        let mut out = Vec::new();
        for item in tree.scan_prefix(&prefix) {
            let (key, _) = item?;
            out.push(String::from_utf8_lossy(&key[prefix.len()..]).into_owned());
        }
        Ok(out)
    }

    fn all_ctr_ids(&self) -> Result<Vec<String>, EngineError> {
        self.all_ctrs
            .iter()
            .keys()
            .map(|k| Ok(ivec_str(&k?)))
            .collect()
    }
}

#[async_trait]
impl StateStore for KvState {
    async fn close(&self) -> Result<(), EngineError> {
        self.closed.store(true, Ordering::SeqCst);
        self.db.flush()?;
        Ok(())
    }

    async fn refresh(&self) -> Result<(), EngineError> {
        self.check_open()?;
        let _w = self.write_lock.lock();

        for id in self.all_ctr_ids()? {
            let mut state = match self.load_ctr_state(&id) {
                Ok(s) => s,
                Err(e) => {
                    tracing::error!(ctr = id.as_str(), error = %e, "skipping unreadable container state during refresh");
                    continue;
                }
            };
            state.reset_transient();
            self.ctrs
                .insert(sub_key(&id, KEY_STATE), serde_json::to_vec(&state)?)?;
            // The legacy location is cleared along with the state field.
            self.ctrs.remove(sub_key(&id, KEY_LEGACY_NETNS))?;
        }

        for item in self.all_pods.iter() {
            let (key, _) = item?;
            let id = ivec_str(&key);
            if let Some(raw) = self.pods.get(sub_key(&id, KEY_STATE))? {
                let mut state: PodState = serde_json::from_slice(&raw)?;
                state.reset_transient();
                self.pods
                    .insert(sub_key(&id, KEY_STATE), serde_json::to_vec(&state)?)?;
            }
        }

        for item in self.all_volumes.iter() {
            let (key, _) = item?;
            let name = ivec_str(&key);
            if let Some(raw) = self.vols.get(sub_key(&name, KEY_STATE))? {
                let mut state: VolumeState = serde_json::from_slice(&raw)?;
                state.reset_transient();
                self.vols
                    .insert(sub_key(&name, KEY_STATE), serde_json::to_vec(&state)?)?;
            }
        }

        self.execs.clear()?;
        self.flush()
    }

    async fn db_config(&self) -> Result<DBConfig, EngineError> {
        self.check_open()?;
        let mut stored = DBConfig::default();
        for name in [
            dbconfig::CFG_OS,
            dbconfig::CFG_STATIC_DIR,
            dbconfig::CFG_TMP_DIR,
            dbconfig::CFG_RUN_ROOT,
            dbconfig::CFG_GRAPH_ROOT,
            dbconfig::CFG_GRAPH_DRIVER,
            dbconfig::CFG_VOLUME_PATH,
        ] {
            if let Some(v) = self.runtime_config.get(name)? {
                stored.set_field(name, ivec_str(&v));
            }
        }
        Ok(stored)
    }

    async fn validate_db_config(
        &self,
        config: &EngineConfig,
        lenient: bool,
    ) -> Result<(), EngineError> {
        let stored = self.db_config().await?;
        let missing = dbconfig::compare(&stored, config, lenient)?;
        if !missing.is_empty() {
            let _w = self.write_lock.lock();
            for (name, value) in missing {
                self.runtime_config.insert(name, value.as_str())?;
            }
            self.flush()?;
        }
        Ok(())
    }

    async fn add_container(
        &self,
        config: &ContainerConfig,
        state: &ContainerState,
    ) -> Result<(), EngineError> {
        if config.pod_id.is_some() {
            return Err(EngineError::InvalidArg(
                "container has a pod; add it through the pod".to_string(),
            ));
        }
        self.add_container_inner(None, config, state)
    }

    async fn add_container_to_pod(
        &self,
        pod_id: &str,
        config: &ContainerConfig,
        state: &ContainerState,
    ) -> Result<(), EngineError> {
        if config.pod_id.as_deref() != Some(pod_id) {
            return Err(EngineError::InvalidArg(format!(
                "container config names pod {:?} but was added to pod {}",
                config.pod_id, pod_id
            )));
        }
        self.add_container_inner(Some(pod_id), config, state)
    }

    async fn remove_container(&self, id: &str) -> Result<(), EngineError> {
        self.remove_container_inner(None, id)
    }

    async fn remove_container_from_pod(&self, pod_id: &str, id: &str) -> Result<(), EngineError> {
        self.remove_container_inner(Some(pod_id), id)
    }

    async fn container_state(&self, id: &str) -> Result<ContainerState, EngineError> {
        self.check_open()?;
        self.load_ctr_state(id)
    }

    async fn save_container(&self, id: &str, state: &ContainerState) -> Result<(), EngineError> {
        self.check_open()?;
        let _w = self.write_lock.lock();
        if !self.ctr_exists(id)? {
            return Err(EngineError::NoSuchCtr(id.to_string()));
        }
        self.ctrs
            .insert(sub_key(id, KEY_STATE), serde_json::to_vec(state)?)?;
        self.flush()
    }

    async fn container_config(&self, id: &str) -> Result<ContainerConfig, EngineError> {
        self.check_open()?;
        self.load_ctr_config(id)
    }

    async fn has_container(&self, id: &str) -> Result<bool, EngineError> {
        self.check_open()?;
        self.ctr_exists(id)
    }

    async fn all_containers(&self) -> Result<Vec<(ContainerConfig, ContainerState)>, EngineError> {
        self.check_open()?;
        let mut out = Vec::new();
        for id in self.all_ctr_ids()? {
            out.push((self.load_ctr_config(&id)?, self.load_ctr_state(&id)?));
        }
        Ok(out)
    }

    async fn lookup_container_id(&self, id_or_name: &str) -> Result<String, EngineError> {
        self.check_open()?;

        if self.ctr_exists(id_or_name)? {
            return Ok(id_or_name.to_string());
        }

        let mut name_was_pod = false;
        if let Some(mapped) = self.name_registry.get(id_or_name)? {
            let mapped = ivec_str(&mapped);
            if self.ctr_exists(&mapped)? {
                return Ok(mapped);
            }
            // The name belongs to a pod; remembered for the error message.
            name_was_pod = true;
        }

        match match_prefix(self.all_ctr_ids()?, id_or_name) {
            PrefixMatch::Unique(id) => Ok(id),
            PrefixMatch::Ambiguous => Err(EngineError::CtrExists(format!(
                "more than one result for container ID prefix {}",
                id_or_name
            ))),
            PrefixMatch::None => Err(lookup_failure(id_or_name, name_was_pod)),
        }
    }

    async fn container_dependents(&self, id: &str) -> Result<Vec<String>, EngineError> {
        self.check_open()?;
        if !self.ctr_exists(id)? {
            return Err(EngineError::NoSuchCtr(id.to_string()));
        }
        self.scan_sub_ids(&self.ctrs, id, KEY_DEPENDENCIES)
    }

    async fn rewrite_container_config(
        &self,
        id: &str,
        config: &ContainerConfig,
    ) -> Result<(), EngineError> {
        self.check_open()?;
        let _w = self.write_lock.lock();
        let (old, _) = self.read_ctr_config(id)?;
        if old.id != config.id || old.name != config.name || old.pod_id != config.pod_id {
            return Err(EngineError::InvalidArg(
                "config rewrite must not change ID, name, or pod".to_string(),
            ));
        }
        self.ctrs
            .insert(sub_key(id, KEY_CONFIG), serde_json::to_vec(config)?)?;
        self.flush()
    }

    async fn safe_rewrite_container_config(
        &self,
        id: &str,
        old_name: &str,
        new_name: &str,
        config: &ContainerConfig,
    ) -> Result<(), EngineError> {
        self.check_open()?;
        let _w = self.write_lock.lock();
        let (old, _) = self.read_ctr_config(id)?;
        if old.id != config.id || old.pod_id != config.pod_id {
            return Err(EngineError::InvalidArg(
                "config rewrite must not change ID or pod".to_string(),
            ));
        }
        if old.name != old_name {
            return Err(EngineError::InvalidArg(format!(
                "container {} is named {}, not {}",
                id, old.name, old_name
            )));
        }
        if config.name != new_name {
            return Err(EngineError::InvalidArg(
                "new config does not carry the new name".to_string(),
            ));
        }
        if old_name != new_name {
            if let Some(taken_by) = self.name_registry.get(new_name)? {
                let owner = ivec_str(&taken_by);
                if owner != id {
                    return Err(if self.pod_exists(&owner)? {
                        EngineError::PodExists(new_name.to_string())
                    } else {
                        EngineError::CtrExists(new_name.to_string())
                    });
                }
            }
            self.name_registry.remove(old_name)?;
            self.name_registry.insert(new_name, id)?;
            self.id_registry.insert(id, new_name)?;
            self.all_ctrs.insert(id, new_name)?;
        }
        self.ctrs
            .insert(sub_key(id, KEY_CONFIG), serde_json::to_vec(config)?)?;
        self.flush()
    }

    async fn rewrite_pod_config(&self, id: &str, config: &PodConfig) -> Result<(), EngineError> {
        self.check_open()?;
        let _w = self.write_lock.lock();
        let raw = self
            .pods
            .get(sub_key(id, KEY_CONFIG))?
            .ok_or_else(|| EngineError::NoSuchPod(id.to_string()))?;
        let old: PodConfig = serde_json::from_slice(&raw)?;
        if old.id != config.id || old.name != config.name {
            return Err(EngineError::InvalidArg(
                "pod config rewrite must not change ID or name".to_string(),
            ));
        }
        self.pods
            .insert(sub_key(id, KEY_CONFIG), serde_json::to_vec(config)?)?;
        self.flush()
    }

    async fn rewrite_volume_config(
        &self,
        name: &str,
        config: &VolumeConfig,
    ) -> Result<(), EngineError> {
        self.check_open()?;
        let _w = self.write_lock.lock();
        if self.vols.get(sub_key(name, KEY_CONFIG))?.is_none() {
            return Err(EngineError::NoSuchVolume(name.to_string()));
        }
        if config.name != name {
            return Err(EngineError::InvalidArg(
                "volume config rewrite must not change the name".to_string(),
            ));
        }
        self.vols
            .insert(sub_key(name, KEY_CONFIG), serde_json::to_vec(config)?)?;
        self.flush()
    }

    async fn add_pod(&self, config: &PodConfig, state: &PodState) -> Result<(), EngineError> {
        self.check_open()?;
        let _w = self.write_lock.lock();
        self.check_registry_free(&config.id, &config.name)?;

        self.id_registry.insert(config.id.as_str(), config.name.as_str())?;
        self.name_registry.insert(config.name.as_str(), config.id.as_str())?;
        self.all_pods.insert(config.id.as_str(), config.name.as_str())?;
        self.pods
            .insert(sub_key(&config.id, KEY_CONFIG), serde_json::to_vec(config)?)?;
        self.pods
            .insert(sub_key(&config.id, KEY_STATE), serde_json::to_vec(state)?)?;
        self.flush()
    }

    async fn remove_pod(&self, id: &str) -> Result<(), EngineError> {
        self.check_open()?;
        let _w = self.write_lock.lock();
        let raw = self
            .pods
            .get(sub_key(id, KEY_CONFIG))?
            .ok_or_else(|| EngineError::NoSuchPod(id.to_string()))?;
        let config: PodConfig = serde_json::from_slice(&raw)?;

        let members = self.scan_sub_ids(&self.pods, id, KEY_CONTAINERS)?;
        if !members.is_empty() {
            return Err(EngineError::Internal(format!(
                "pod {} still contains containers: {}",
                id,
                members.join(", ")
            )));
        }

        let prefix = format!("{}/", id);
        let keys: Vec<sled::IVec> = self
            .pods
            .scan_prefix(prefix.as_bytes())
            .keys()
            .collect::<Result<_, _>>()?;
        for key in keys {
            self.pods.remove(key)?;
        }
        self.id_registry.remove(id)?;
        self.name_registry.remove(config.name.as_str())?;
        self.all_pods.remove(id)?;
        self.flush()
    }

    async fn pod_state(&self, id: &str) -> Result<PodState, EngineError> {
        self.check_open()?;
        let raw = self
            .pods
            .get(sub_key(id, KEY_STATE))?
            .ok_or_else(|| EngineError::NoSuchPod(id.to_string()))?;
        Ok(serde_json::from_slice(&raw)?)
    }

    async fn save_pod(&self, id: &str, state: &PodState) -> Result<(), EngineError> {
        self.check_open()?;
        let _w = self.write_lock.lock();
        if !self.pod_exists(id)? {
            return Err(EngineError::NoSuchPod(id.to_string()));
        }
        self.pods
            .insert(sub_key(id, KEY_STATE), serde_json::to_vec(state)?)?;
        self.flush()
    }

    async fn pod_config(&self, id: &str) -> Result<PodConfig, EngineError> {
        self.check_open()?;
        let raw = self
            .pods
            .get(sub_key(id, KEY_CONFIG))?
            .ok_or_else(|| EngineError::NoSuchPod(id.to_string()))?;
        Ok(serde_json::from_slice(&raw)?)
    }

    async fn has_pod(&self, id: &str) -> Result<bool, EngineError> {
        self.check_open()?;
        self.pod_exists(id)
    }

    async fn all_pods(&self) -> Result<Vec<(PodConfig, PodState)>, EngineError> {
        self.check_open()?;
        let mut out = Vec::new();
        for item in self.all_pods.iter() {
            let (key, _) = item?;
            let id = ivec_str(&key);
            out.push((self.pod_config(&id).await?, self.pod_state(&id).await?));
        }
        Ok(out)
    }

    async fn lookup_pod_id(&self, id_or_name: &str) -> Result<String, EngineError> {
        self.check_open()?;
        if self.pod_exists(id_or_name)? {
            return Ok(id_or_name.to_string());
        }
        if let Some(mapped) = self.name_registry.get(id_or_name)? {
            let mapped = ivec_str(&mapped);
            if self.pod_exists(&mapped)? {
                return Ok(mapped);
            }
        }
        let ids: Vec<String> = self
            .all_pods
            .iter()
            .keys()
            .map(|k| Ok::<_, EngineError>(ivec_str(&k?)))
            .collect::<Result<_, _>>()?;
        match match_prefix(ids, id_or_name) {
            PrefixMatch::Unique(id) => Ok(id),
            PrefixMatch::Ambiguous => Err(EngineError::PodExists(format!(
                "more than one result for pod ID prefix {}",
                id_or_name
            ))),
            PrefixMatch::None => Err(EngineError::NoSuchPod(id_or_name.to_string())),
        }
    }

    async fn pod_containers(&self, id: &str) -> Result<Vec<String>, EngineError> {
        self.check_open()?;
        if !self.pod_exists(id)? {
            return Err(EngineError::NoSuchPod(id.to_string()));
        }
        self.scan_sub_ids(&self.pods, id, KEY_CONTAINERS)
    }

    async fn add_volume(
        &self,
        config: &VolumeConfig,
        state: &VolumeState,
    ) -> Result<(), EngineError> {
        self.check_open()?;
        let _w = self.write_lock.lock();
        if self.all_volumes.get(config.name.as_str())?.is_some() {
            return Err(EngineError::VolumeExists(config.name.clone()));
        }
        self.all_volumes
            .insert(config.name.as_str(), config.name.as_str())?;
        self.vols
            .insert(sub_key(&config.name, KEY_CONFIG), serde_json::to_vec(config)?)?;
        self.vols
            .insert(sub_key(&config.name, KEY_STATE), serde_json::to_vec(state)?)?;
        self.flush()
    }

    async fn remove_volume(&self, name: &str) -> Result<(), EngineError> {
        self.check_open()?;
        let _w = self.write_lock.lock();
        if self.all_volumes.get(name)?.is_none() {
            return Err(EngineError::NoSuchVolume(name.to_string()));
        }
        let users = self.scan_volume_users(name)?;
        if !users.is_empty() {
            return Err(EngineError::VolumeBeingUsed {
                name: name.to_string(),
                users: users.join(", "),
            });
        }
        let prefix = format!("{}/", name);
        let keys: Vec<sled::IVec> = self
            .vols
            .scan_prefix(prefix.as_bytes())
            .keys()
            .collect::<Result<_, _>>()?;
        for key in keys {
            self.vols.remove(key)?;
        }
        self.all_volumes.remove(name)?;
        self.flush()
    }

    async fn volume_state(&self, name: &str) -> Result<VolumeState, EngineError> {
        self.check_open()?;
        if self.all_volumes.get(name)?.is_none() {
            return Err(EngineError::NoSuchVolume(name.to_string()));
        }
        // State may be absent in old records; treat as the zero value.
        match self.vols.get(sub_key(name, KEY_STATE))? {
            Some(raw) => Ok(serde_json::from_slice(&raw)?),
            None => Ok(VolumeState::default()),
        }
    }

    async fn save_volume(&self, name: &str, state: &VolumeState) -> Result<(), EngineError> {
        self.check_open()?;
        let _w = self.write_lock.lock();
        if self.all_volumes.get(name)?.is_none() {
            return Err(EngineError::NoSuchVolume(name.to_string()));
        }
        self.vols
            .insert(sub_key(name, KEY_STATE), serde_json::to_vec(state)?)?;
        self.flush()
    }

    async fn volume_config(&self, name: &str) -> Result<VolumeConfig, EngineError> {
        self.check_open()?;
        let raw = self
            .vols
            .get(sub_key(name, KEY_CONFIG))?
            .ok_or_else(|| EngineError::NoSuchVolume(name.to_string()))?;
        Ok(serde_json::from_slice(&raw)?)
    }

    async fn has_volume(&self, name: &str) -> Result<bool, EngineError> {
        self.check_open()?;
        Ok(self.all_volumes.get(name)?.is_some())
    }

    async fn all_volumes(&self) -> Result<Vec<(VolumeConfig, VolumeState)>, EngineError> {
        self.check_open()?;
        let mut out = Vec::new();
        for item in self.all_volumes.iter() {
            let (key, _) = item?;
            let name = ivec_str(&key);
            out.push((self.volume_config(&name).await?, self.volume_state(&name).await?));
        }
        Ok(out)
    }

    async fn volume_users(&self, name: &str) -> Result<Vec<String>, EngineError> {
        self.check_open()?;
        self.scan_volume_users(name)
    }

    async fn add_container_exit_code(&self, id: &str, code: i32) -> Result<(), EngineError> {
        self.check_open()?;
        check_exit_code(code)?;
        let _w = self.write_lock.lock();
        self.exit_codes.insert(id, code.to_string().as_str())?;
        self.exit_code_times
            .insert(id, now_unix().to_string().as_str())?;
        self.flush()
    }

    async fn container_exit_code(&self, id: &str) -> Result<i32, EngineError> {
        self.check_open()?;
        let raw = self
            .exit_codes
            .get(id)?
            .ok_or_else(|| EngineError::NoSuchExitCode(id.to_string()))?;
        ivec_str(&raw)
            .parse()
            .map_err(|_| EngineError::Internal(format!("malformed exit code entry for {}", id)))
    }

    async fn prune_container_exit_codes(&self, cutoff: i64) -> Result<(), EngineError> {
        self.check_open()?;
        let _w = self.write_lock.lock();
        let mut stale = Vec::new();
        for item in self.exit_code_times.iter() {
            let (key, raw) = item?;
            let ts: i64 = ivec_str(&raw).parse().unwrap_or(0);
            if ts < cutoff {
                stale.push(key);
            }
        }
        for key in stale {
            self.exit_codes.remove(&key)?;
            self.exit_code_times.remove(&key)?;
        }
        self.flush()
    }

    async fn network_connect(
        &self,
        id: &str,
        network: &str,
        opts: &PerNetworkOptions,
    ) -> Result<(), EngineError> {
        self.check_open()?;
        let _w = self.write_lock.lock();
        if !self.ctr_exists(id)? {
            return Err(EngineError::NoSuchCtr(id.to_string()));
        }
        let key = format!("{}/{}/{}", id, KEY_NETWORKS, network);
        if self.ctrs.get(key.as_bytes())?.is_some() {
            return Err(EngineError::NetworkConnected {
                ctr: id.to_string(),
                network: network.to_string(),
            });
        }
        self.ctrs.insert(key.as_bytes(), serde_json::to_vec(opts)?)?;
        self.flush()
    }

    async fn network_disconnect(&self, id: &str, network: &str) -> Result<(), EngineError> {
        self.check_open()?;
        let _w = self.write_lock.lock();
        if !self.ctr_exists(id)? {
            return Err(EngineError::NoSuchCtr(id.to_string()));
        }
        let key = format!("{}/{}/{}", id, KEY_NETWORKS, network);
        if self.ctrs.remove(key.as_bytes())?.is_none() {
            return Err(EngineError::NoSuchNetwork(network.to_string()));
        }
        self.flush()
    }

    async fn network_modify(
        &self,
        id: &str,
        network: &str,
        opts: &PerNetworkOptions,
    ) -> Result<(), EngineError> {
        self.check_open()?;
        let _w = self.write_lock.lock();
        let key = format!("{}/{}/{}", id, KEY_NETWORKS, network);
        if self.ctrs.get(key.as_bytes())?.is_none() {
            return Err(EngineError::NoSuchNetwork(network.to_string()));
        }
        self.ctrs.insert(key.as_bytes(), serde_json::to_vec(opts)?)?;
        self.flush()
    }

    async fn container_networks(
        &self,
        id: &str,
    ) -> Result<HashMap<String, PerNetworkOptions>, EngineError> {
        self.check_open()?;
        if !self.ctr_exists(id)? {
            return Err(EngineError::NoSuchCtr(id.to_string()));
        }
        let prefix = sub_prefix(id, KEY_NETWORKS);
        let mut out = HashMap::new();
        for item in self.ctrs.scan_prefix(&prefix) {
            let (key, raw) = item?;
            let name = String::from_utf8_lossy(&key[prefix.len()..]).into_owned();
            out.insert(name, serde_json::from_slice(&raw)?);
        }
        Ok(out)
    }

    async fn add_exec_session(&self, session: &ExecSession) -> Result<(), EngineError> {
        self.check_open()?;
        let _w = self.write_lock.lock();
        if !self.ctr_exists(&session.container_id)? {
            return Err(EngineError::NoSuchCtr(session.container_id.clone()));
        }
        if self.execs.get(session.id.as_str())?.is_some() {
            return Err(EngineError::Internal(format!(
                "exec session ID {} is in use",
                session.id
            )));
        }
        self.execs
            .insert(session.id.as_str(), serde_json::to_vec(session)?)?;
        self.flush()
    }

    async fn exec_session(&self, id: &str) -> Result<ExecSession, EngineError> {
        self.check_open()?;
        let raw = self
            .execs
            .get(id)?
            .ok_or_else(|| EngineError::NoSuchExecSession(id.to_string()))?;
        Ok(serde_json::from_slice(&raw)?)
    }

    async fn save_exec_session(&self, session: &ExecSession) -> Result<(), EngineError> {
        self.check_open()?;
        let _w = self.write_lock.lock();
        if self.execs.get(session.id.as_str())?.is_none() {
            return Err(EngineError::NoSuchExecSession(session.id.clone()));
        }
        self.execs
            .insert(session.id.as_str(), serde_json::to_vec(session)?)?;
        self.flush()
    }

    async fn remove_exec_session(&self, id: &str) -> Result<(), EngineError> {
        self.check_open()?;
        let _w = self.write_lock.lock();
        if self.execs.remove(id)?.is_none() {
            return Err(EngineError::NoSuchExecSession(id.to_string()));
        }
        self.flush()
    }

    async fn container_exec_sessions(&self, ctr_id: &str) -> Result<Vec<String>, EngineError> {
        self.check_open()?;
        let mut out = Vec::new();
        for item in self.execs.iter() {
            let (key, raw) = item?;
            let session: ExecSession = serde_json::from_slice(&raw)?;
            if session.container_id == ctr_id {
                out.push(ivec_str(&key));
            }
        }
        Ok(out)
    }

    async fn remove_container_exec_sessions(&self, ctr_id: &str) -> Result<(), EngineError> {
        self.check_open()?;
        let _w = self.write_lock.lock();
        let mut stale = Vec::new();
        for item in self.execs.iter() {
            let (key, raw) = item?;
            let session: ExecSession = serde_json::from_slice(&raw)?;
            if session.container_id == ctr_id {
                stale.push(key);
            }
        }
        for key in stale {
            self.execs.remove(&key)?;
        }
        self.flush()
    }

    async fn all_lock_ids(&self) -> Result<Vec<(String, String, locks::LockId)>, EngineError> {
        self.check_open()?;
        let mut out = Vec::new();
        for id in self.all_ctr_ids()? {
            out.push(("container".to_string(), id.clone(), self.load_ctr_config(&id)?.lock_id));
        }
        for item in self.all_pods.iter() {
            let (key, _) = item?;
            let id = ivec_str(&key);
            out.push(("pod".to_string(), id.clone(), self.pod_config(&id).await?.lock_id));
        }
        for item in self.all_volumes.iter() {
            let (key, _) = item?;
            let name = ivec_str(&key);
            out.push((
                "volume".to_string(),
                name.clone(),
                self.volume_config(&name).await?.lock_id,
            ));
        }
        Ok(out)
    }
}

impl KvState {
    fn scan_volume_users(&self, name: &str) -> Result<Vec<String>, EngineError> {
        let prefix = format!("{}/", name);
        let mut out = Vec::new();
        for item in self.volume_ctrs.scan_prefix(prefix.as_bytes()) {
            let (key, _) = item?;
            out.push(String::from_utf8_lossy(&key[prefix.len()..]).into_owned());
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{ContainerStatus, NamedVolumeRef};
    use crate::util::new_id;
    use tempfile::TempDir;

    fn open_store(dir: &TempDir) -> KvState {
        KvState::open(dir.path()).unwrap()
    }

    fn ctr(name: &str) -> (ContainerConfig, ContainerState) {
        (
            ContainerConfig {
                id: new_id(),
                name: name.to_string(),
                lock_id: 1,
                ..Default::default()
            },
            ContainerState::default(),
        )
    }

    #[tokio::test]
    async fn test_add_lookup_remove_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let (config, state) = ctr("web");

        store.add_container(&config, &state).await.unwrap();
        assert_eq!(store.lookup_container_id("web").await.unwrap(), config.id);
        assert_eq!(
            store.lookup_container_id(&config.id[..8]).await.unwrap(),
            config.id
        );

        let loaded = store.container_config(&config.id).await.unwrap();
        assert_eq!(loaded.name, "web");

        store.remove_container(&config.id).await.unwrap();
        assert!(matches!(
            store.lookup_container_id("web").await,
            Err(EngineError::NoSuchCtr(_))
        ));
        assert!(!store.has_container(&config.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_name_clash_distinguishes_pods() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);

        let pod = PodConfig {
            id: new_id(),
            name: "shared".to_string(),
            ..Default::default()
        };
        store.add_pod(&pod, &PodState::default()).await.unwrap();

        let (config, state) = ctr("shared");
        assert!(matches!(
            store.add_container(&config, &state).await,
            Err(EngineError::PodExists(_))
        ));

        let (config2, state2) = ctr("other");
        store.add_container(&config2, &state2).await.unwrap();
        let (dup, dup_state) = ctr("other");
        assert!(matches!(
            store.add_container(&dup, &dup_state).await,
            Err(EngineError::CtrExists(_))
        ));
    }

    #[tokio::test]
    async fn test_lookup_name_that_is_pod() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let pod = PodConfig {
            id: new_id(),
            name: "mypod".to_string(),
            ..Default::default()
        };
        store.add_pod(&pod, &PodState::default()).await.unwrap();

        match store.lookup_container_id("mypod").await {
            Err(EngineError::NoSuchCtr(msg)) => {
                assert!(msg.contains("is a pod, not a container"))
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_dependency_back_edges() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let (base, base_state) = ctr("base");
        store.add_container(&base, &base_state).await.unwrap();

        let (mut dep, dep_state) = ctr("dependent");
        dep.dependencies = vec![base.id.clone()];
        store.add_container(&dep, &dep_state).await.unwrap();

        assert_eq!(
            store.container_dependents(&base.id).await.unwrap(),
            vec![dep.id.clone()]
        );

        // Base cannot be removed while a dependent exists.
        assert!(matches!(
            store.remove_container(&base.id).await,
            Err(EngineError::DepExists { .. })
        ));

        store.remove_container(&dep.id).await.unwrap();
        assert!(store
            .container_dependents(&base.id)
            .await
            .unwrap()
            .is_empty());
        store.remove_container(&base.id).await.unwrap();
    }

    #[tokio::test]
    async fn test_pod_membership() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let pod = PodConfig {
            id: new_id(),
            name: "p".to_string(),
            ..Default::default()
        };
        store.add_pod(&pod, &PodState::default()).await.unwrap();

        let (mut member, member_state) = ctr("member");
        member.pod_id = Some(pod.id.clone());
        store
            .add_container_to_pod(&pod.id, &member, &member_state)
            .await
            .unwrap();
        assert_eq!(
            store.pod_containers(&pod.id).await.unwrap(),
            vec![member.id.clone()]
        );

        // Pod removal is refused while members remain.
        assert!(store.remove_pod(&pod.id).await.is_err());
        // Plain container removal is refused for pod members.
        assert!(matches!(
            store.remove_container(&member.id).await,
            Err(EngineError::InvalidArg(_))
        ));

        store
            .remove_container_from_pod(&pod.id, &member.id)
            .await
            .unwrap();
        store.remove_pod(&pod.id).await.unwrap();
        assert!(matches!(
            store.lookup_pod_id("p").await,
            Err(EngineError::NoSuchPod(_))
        ));
    }

    #[tokio::test]
    async fn test_volume_reference_counting() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);

        let vol = VolumeConfig {
            name: "data".to_string(),
            ..Default::default()
        };
        store.add_volume(&vol, &VolumeState::default()).await.unwrap();

        let (mut config, state) = ctr("user");
        config.named_volumes = vec![NamedVolumeRef {
            name: "data".to_string(),
            dest: "/data".to_string(),
            options: Vec::new(),
            sub_path: String::new(),
            is_anonymous: false,
        }];
        store.add_container(&config, &state).await.unwrap();

        assert_eq!(store.volume_users("data").await.unwrap(), vec![config.id.clone()]);
        assert!(matches!(
            store.remove_volume("data").await,
            Err(EngineError::VolumeBeingUsed { .. })
        ));

        store.remove_container(&config.id).await.unwrap();
        assert!(store.volume_users("data").await.unwrap().is_empty());
        store.remove_volume("data").await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_volume_rejected_at_add() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let (mut config, state) = ctr("user");
        config.named_volumes = vec![NamedVolumeRef {
            name: "ghost".to_string(),
            dest: "/data".to_string(),
            options: Vec::new(),
            sub_path: String::new(),
            is_anonymous: false,
        }];
        assert!(matches!(
            store.add_container(&config, &state).await,
            Err(EngineError::NoSuchVolume(_))
        ));
    }

    #[tokio::test]
    async fn test_exit_code_cache() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);

        store.add_container_exit_code("abc", 7).await.unwrap();
        assert_eq!(store.container_exit_code("abc").await.unwrap(), 7);

        assert!(store.add_container_exit_code("abc", 300).await.is_err());

        // Prune with a cutoff in the past keeps the entry...
        store
            .prune_container_exit_codes(now_unix() - 300)
            .await
            .unwrap();
        assert_eq!(store.container_exit_code("abc").await.unwrap(), 7);

        // ...and a future cutoff removes it.
        store
            .prune_container_exit_codes(now_unix() + 10)
            .await
            .unwrap();
        assert!(matches!(
            store.container_exit_code("abc").await,
            Err(EngineError::NoSuchExitCode(_))
        ));
    }

    #[tokio::test]
    async fn test_safe_rewrite_rename() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let (config, state) = ctr("old");
        store.add_container(&config, &state).await.unwrap();

        let mut renamed = config.clone();
        renamed.name = "new".to_string();
        store
            .safe_rewrite_container_config(&config.id, "old", "new", &renamed)
            .await
            .unwrap();

        assert_eq!(store.lookup_container_id("new").await.unwrap(), config.id);
        assert!(matches!(
            store.lookup_container_id("old").await,
            Err(EngineError::NoSuchCtr(_))
        ));
    }

    #[tokio::test]
    async fn test_legacy_netns_adopted() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let (config, state) = ctr("legacy");
        store.add_container(&config, &state).await.unwrap();

        // Simulate an old database with the netns under the legacy key.
        store
            .ctrs
            .insert(sub_key(&config.id, KEY_LEGACY_NETNS), "/run/netns/old")
            .unwrap();

        let state = store.container_state(&config.id).await.unwrap();
        assert_eq!(state.net_ns, "/run/netns/old");

        // A state-embedded value wins over the legacy key.
        let mut new_state = state.clone();
        new_state.net_ns = "/run/netns/new".to_string();
        store.save_container(&config.id, &new_state).await.unwrap();
        assert_eq!(
            store.container_state(&config.id).await.unwrap().net_ns,
            "/run/netns/new"
        );
    }

    #[tokio::test]
    async fn test_refresh_clears_transient_state() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let (config, _) = ctr("running");
        let state = ContainerState {
            state: ContainerStatus::Running,
            pid: 1234,
            ..Default::default()
        };
        store.add_container(&config, &state).await.unwrap();

        let session = ExecSession {
            id: new_id(),
            container_id: config.id.clone(),
            ..Default::default()
        };
        store.add_exec_session(&session).await.unwrap();

        store.refresh().await.unwrap();

        let state = store.container_state(&config.id).await.unwrap();
        assert_eq!(state.state, ContainerStatus::Configured);
        assert_eq!(state.pid, 0);
        assert!(matches!(
            store.exec_session(&session.id).await,
            Err(EngineError::NoSuchExecSession(_))
        ));
    }

    #[tokio::test]
    async fn test_db_config_records_then_validates() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let config = EngineConfig {
            static_dir: dir.path().join("state"),
            tmp_dir: dir.path().join("tmp"),
            run_root: dir.path().join("run"),
            graph_root: dir.path().join("graph"),
            volume_path: dir.path().join("volumes"),
            ..Default::default()
        };

        store.validate_db_config(&config, false).await.unwrap();
        let stored = store.db_config().await.unwrap();
        assert!(stored.graph_root.is_some());

        // Same paths validate again.
        store.validate_db_config(&config, false).await.unwrap();

        // A moved graph root is rejected.
        let mut moved = config.clone();
        moved.graph_root = dir.path().join("elsewhere");
        assert!(matches!(
            store.validate_db_config(&moved, false).await,
            Err(EngineError::DBBadConfig(_))
        ));
    }

    #[tokio::test]
    async fn test_closed_store_rejects_operations() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        store.close().await.unwrap();
        assert!(matches!(
            store.has_container("x").await,
            Err(EngineError::DBClosed)
        ));
    }
}
