//! Lock conflict detection and renumbering.
//!
//! Two live entities sharing a lock index means the database is corrupt;
//! the fix is a renumber: with exclusive engine access, reset the pool and
//! hand every entity a fresh index, rewriting configs through the rewrite
//! paths.

use std::collections::HashMap;

use crate::errors::EngineError;
use crate::events::{EventKind, EventStatus};

use super::boot::AliveLock;
use super::Engine;

impl Engine {
    /// Lock indices claimed by more than one live entity, with the
    /// claimants. A non-empty result calls for [`Engine::renumber_locks`].
    pub async fn lock_conflicts(
        &self,
    ) -> Result<HashMap<locks::LockId, Vec<(String, String)>>, EngineError> {
        self.inner.check_valid()?;
        let mut by_lock: HashMap<locks::LockId, Vec<(String, String)>> = HashMap::new();
        for (kind, id, lock_id) in self.inner.store.all_lock_ids().await? {
            by_lock.entry(lock_id).or_default().push((kind, id));
        }
        by_lock.retain(|_, claimants| claimants.len() > 1);
        Ok(by_lock)
    }

    /// Rewrite every entity's lock index. Requires exclusive engine access:
    /// the alive lock is held for the duration, and any other handle to
    /// this engine's entities becomes stale.
    pub async fn renumber_locks(&self) -> Result<(), EngineError> {
        self.inner.check_valid()?;
        let _alive = AliveLock::acquire(&self.inner.config.tmp_dir)?;

        // Reset the pool: every index freed, allocation state cleared.
        for id in 0..self.inner.lock_manager.count() {
            self.inner.lock_manager.free(id)?;
        }

        for (kind, id, old_lock) in self.inner.store.all_lock_ids().await? {
            let new_lock = self.inner.lock_manager.allocate()?;
            match kind.as_str() {
                "container" => {
                    let mut config = self.inner.store.container_config(&id).await?;
                    config.lock_id = new_lock;
                    self.inner.store.rewrite_container_config(&id, &config).await?;
                }
                "pod" => {
                    let mut config = self.inner.store.pod_config(&id).await?;
                    config.lock_id = new_lock;
                    self.inner.store.rewrite_pod_config(&id, &config).await?;
                }
                "volume" => {
                    let mut config = self.inner.store.volume_config(&id).await?;
                    config.lock_id = new_lock;
                    self.inner.store.rewrite_volume_config(&id, &config).await?;
                }
                other => {
                    return Err(EngineError::Internal(format!(
                        "unknown entity kind \"{}\" during renumber",
                        other
                    )))
                }
            }
            tracing::debug!(kind = kind.as_str(), id = id.as_str(), old_lock, new_lock, "renumbered entity lock");
        }

        self.inner
            .event(EventKind::System, EventStatus::Renumber, "", "engine")
            .await;
        Ok(())
    }
}
