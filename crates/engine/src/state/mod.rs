//! State store — persistent single-writer database of engine entities.
//!
//! Two backends implement the same contract: a nested-bucket KV store
//! (`kv`, sled) and a single-file relational store (`sql`, sqlite). Backend
//! choice is configuration, not a type; the engine holds a `Box<dyn
//! StateStore>`.

pub mod dbconfig;
pub mod kv;
pub mod sql;

use std::collections::HashMap;

use async_trait::async_trait;

use crate::conf::EngineConfig;
use crate::entity::{
    ContainerConfig, ContainerState, ExecSession, PerNetworkOptions, PodConfig, PodState,
    VolumeConfig, VolumeState,
};
use crate::errors::EngineError;

pub use dbconfig::DBConfig;
pub use kv::KvState;
pub use sql::SqlState;

/// Exit codes outside this range are rejected; -1 means "no recorded exit".
pub const EXIT_CODE_MIN: i32 = -1;
pub const EXIT_CODE_MAX: i32 = 255;

/// Persistent store of containers, pods, volumes, exec sessions, and the
/// runtime-config validation record.
///
/// All writers serialize through store transactions. Implementations must
/// never call back into the engine from inside a transaction.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn close(&self) -> Result<(), EngineError>;

    /// Clear per-boot state for every entity: PIDs, mount state, network
    /// status, exec sessions. Called during refresh, under the alive lock.
    async fn refresh(&self) -> Result<(), EngineError>;

    // ── Runtime-config record ─────────────────────────────────
    async fn db_config(&self) -> Result<DBConfig, EngineError>;

    /// Compare the stored config record against `config`; record missing
    /// fields. With `lenient` set (reset path), path divergence logs a
    /// warning instead of failing.
    async fn validate_db_config(
        &self,
        config: &EngineConfig,
        lenient: bool,
    ) -> Result<(), EngineError>;

    // ── Containers ────────────────────────────────────────────
    async fn add_container(
        &self,
        config: &ContainerConfig,
        state: &ContainerState,
    ) -> Result<(), EngineError>;

    /// Add a container that belongs to `pod_id`. The caller holds the pod
    /// lock.
    async fn add_container_to_pod(
        &self,
        pod_id: &str,
        config: &ContainerConfig,
        state: &ContainerState,
    ) -> Result<(), EngineError>;

    async fn remove_container(&self, id: &str) -> Result<(), EngineError>;

    /// Remove a container from `pod_id`'s member set and from the store.
    async fn remove_container_from_pod(&self, pod_id: &str, id: &str) -> Result<(), EngineError>;

    /// Reload a container's mutable state from the store.
    async fn container_state(&self, id: &str) -> Result<ContainerState, EngineError>;

    /// Persist a container's mutable state. Config is not written.
    async fn save_container(&self, id: &str, state: &ContainerState) -> Result<(), EngineError>;

    async fn container_config(&self, id: &str) -> Result<ContainerConfig, EngineError>;
    async fn has_container(&self, id: &str) -> Result<bool, EngineError>;
    async fn all_containers(&self) -> Result<Vec<(ContainerConfig, ContainerState)>, EngineError>;

    /// Resolve a full ID, full name, or unique ID prefix to a container ID.
    async fn lookup_container_id(&self, id_or_name: &str) -> Result<String, EngineError>;

    /// Containers that depend on `id` (reverse edges).
    async fn container_dependents(&self, id: &str) -> Result<Vec<String>, EngineError>;

    /// Rewrite a container's config in place. Only for migrations and the
    /// locked initialization window; must not change ID, name, or pod.
    async fn rewrite_container_config(
        &self,
        id: &str,
        config: &ContainerConfig,
    ) -> Result<(), EngineError>;

    /// Rewrite that additionally renames the container, updating both name
    /// indices atomically and enforcing uniqueness.
    async fn safe_rewrite_container_config(
        &self,
        id: &str,
        old_name: &str,
        new_name: &str,
        config: &ContainerConfig,
    ) -> Result<(), EngineError>;

    /// Pod analogue of the container config rewrite; may not change ID or
    /// name.
    async fn rewrite_pod_config(&self, id: &str, config: &PodConfig) -> Result<(), EngineError>;

    /// Volume analogue of the container config rewrite; may not change the
    /// name.
    async fn rewrite_volume_config(
        &self,
        name: &str,
        config: &VolumeConfig,
    ) -> Result<(), EngineError>;

    // ── Pods ──────────────────────────────────────────────────
    async fn add_pod(&self, config: &PodConfig, state: &PodState) -> Result<(), EngineError>;

    /// Remove an empty pod. Fails with `Internal` if members remain.
    async fn remove_pod(&self, id: &str) -> Result<(), EngineError>;

    async fn pod_state(&self, id: &str) -> Result<PodState, EngineError>;
    async fn save_pod(&self, id: &str, state: &PodState) -> Result<(), EngineError>;
    async fn pod_config(&self, id: &str) -> Result<PodConfig, EngineError>;
    async fn has_pod(&self, id: &str) -> Result<bool, EngineError>;
    async fn all_pods(&self) -> Result<Vec<(PodConfig, PodState)>, EngineError>;
    async fn lookup_pod_id(&self, id_or_name: &str) -> Result<String, EngineError>;

    /// IDs of the pod's member containers.
    async fn pod_containers(&self, id: &str) -> Result<Vec<String>, EngineError>;

    // ── Volumes ───────────────────────────────────────────────
    async fn add_volume(
        &self,
        config: &VolumeConfig,
        state: &VolumeState,
    ) -> Result<(), EngineError>;
    async fn remove_volume(&self, name: &str) -> Result<(), EngineError>;
    async fn volume_state(&self, name: &str) -> Result<VolumeState, EngineError>;
    async fn save_volume(&self, name: &str, state: &VolumeState) -> Result<(), EngineError>;
    async fn volume_config(&self, name: &str) -> Result<VolumeConfig, EngineError>;
    async fn has_volume(&self, name: &str) -> Result<bool, EngineError>;
    async fn all_volumes(&self) -> Result<Vec<(VolumeConfig, VolumeState)>, EngineError>;

    /// Container IDs holding a reference to the volume.
    async fn volume_users(&self, name: &str) -> Result<Vec<String>, EngineError>;

    // ── Exit-code cache ───────────────────────────────────────
    async fn add_container_exit_code(&self, id: &str, code: i32) -> Result<(), EngineError>;
    async fn container_exit_code(&self, id: &str) -> Result<i32, EngineError>;

    /// Drop cache entries with a timestamp strictly before `cutoff`
    /// (epoch seconds).
    async fn prune_container_exit_codes(&self, cutoff: i64) -> Result<(), EngineError>;

    // ── Per-container network rows ────────────────────────────
    async fn network_connect(
        &self,
        id: &str,
        network: &str,
        opts: &PerNetworkOptions,
    ) -> Result<(), EngineError>;
    async fn network_disconnect(&self, id: &str, network: &str) -> Result<(), EngineError>;
    async fn network_modify(
        &self,
        id: &str,
        network: &str,
        opts: &PerNetworkOptions,
    ) -> Result<(), EngineError>;
    async fn container_networks(
        &self,
        id: &str,
    ) -> Result<HashMap<String, PerNetworkOptions>, EngineError>;

    // ── Exec sessions ─────────────────────────────────────────
    async fn add_exec_session(&self, session: &ExecSession) -> Result<(), EngineError>;
    async fn exec_session(&self, id: &str) -> Result<ExecSession, EngineError>;
    async fn save_exec_session(&self, session: &ExecSession) -> Result<(), EngineError>;
    async fn remove_exec_session(&self, id: &str) -> Result<(), EngineError>;
    async fn container_exec_sessions(&self, ctr_id: &str) -> Result<Vec<String>, EngineError>;
    async fn remove_container_exec_sessions(&self, ctr_id: &str) -> Result<(), EngineError>;

    // ── Lock bookkeeping ──────────────────────────────────────
    /// Every (entity kind, id, lock index) triple in the store. Used for
    /// conflict detection and renumbering.
    async fn all_lock_ids(&self) -> Result<Vec<(String, String, locks::LockId)>, EngineError>;
}

/// Result of matching an ID prefix against a set of full IDs.
pub(crate) enum PrefixMatch {
    None,
    Unique(String),
    Ambiguous,
}

pub(crate) fn match_prefix<I>(ids: I, prefix: &str) -> PrefixMatch
where
    I: IntoIterator<Item = String>,
{
    let mut found: Option<String> = None;
    for id in ids {
        if id.starts_with(prefix) {
            if found.is_some() {
                return PrefixMatch::Ambiguous;
            }
            found = Some(id);
        }
    }
    match found {
        Some(id) => PrefixMatch::Unique(id),
        None => PrefixMatch::None,
    }
}

/// Shared error construction for container lookup, so both backends report
/// identical messages.
pub(crate) fn lookup_failure(id_or_name: &str, name_was_pod: bool) -> EngineError {
    if name_was_pod {
        EngineError::NoSuchCtr(format!("\"{}\" is a pod, not a container", id_or_name))
    } else {
        EngineError::NoSuchCtr(id_or_name.to_string())
    }
}

pub(crate) fn check_exit_code(code: i32) -> Result<(), EngineError> {
    if !(EXIT_CODE_MIN..=EXIT_CODE_MAX).contains(&code) {
        return Err(EngineError::InvalidArg(format!(
            "exit code {} outside the valid range [{}..{}]",
            code, EXIT_CODE_MIN, EXIT_CODE_MAX
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_match_prefix() {
        let ids = || {
            vec![
                "abcd1234".to_string(),
                "abff5678".to_string(),
                "ffff0000".to_string(),
            ]
        };
        assert!(matches!(match_prefix(ids(), "abcd"), PrefixMatch::Unique(id) if id == "abcd1234"));
        assert!(matches!(match_prefix(ids(), "ab"), PrefixMatch::Ambiguous));
        assert!(matches!(match_prefix(ids(), "9"), PrefixMatch::None));
    }

    #[test]
    fn test_exit_code_bounds() {
        assert!(check_exit_code(-1).is_ok());
        assert!(check_exit_code(0).is_ok());
        assert!(check_exit_code(255).is_ok());
        assert!(check_exit_code(-2).is_err());
        assert!(check_exit_code(256).is_err());
    }

    #[test]
    fn test_pod_lookup_failure_message() {
        let err = lookup_failure("web", true);
        assert!(err.to_string().contains("is a pod, not a container"));
    }
}
