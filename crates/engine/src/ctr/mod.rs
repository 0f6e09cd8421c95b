//! Container handle — a short-lived view of one container: store reference,
//! immutable config snapshot, cached mutable state, and the entity lock.
//!
//! Handles never serialize back-pointers; every cross-entity relationship in
//! the database is a pure ID reference. Mutating operations take the entity
//! lock, resync state from the store, act, and persist. A batched section
//! takes the lock once and suspends the implicit resync.

pub mod exec;
pub mod lifecycle;
pub mod network;
pub mod wait;

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;

use crate::entity::{ContainerConfig, ContainerState, ContainerStatus};
use crate::errors::EngineError;
use crate::events::{EventKind, EventStatus};
use crate::oci::{consume_exit_file, OciRuntime};
use crate::runtime::EngineInner;

pub struct Container {
    pub(crate) engine: Arc<EngineInner>,
    pub(crate) config: ContainerConfig,
    pub(crate) state: Mutex<ContainerState>,
    pub(crate) lock: Box<dyn locks::EntityLock>,
    /// Cleared once the container is removed; operations then fail with
    /// `CtrRemoved`.
    pub(crate) valid: AtomicBool,
    /// Inside a batched section: lock held by the caller, no implicit sync.
    pub(crate) batched: AtomicBool,
    /// Set by pod operations that already hold the pod lock, authorizing
    /// container locking underneath it.
    pub(crate) pod_lock_held: AtomicBool,
}

impl Container {
    /// Load a handle for an existing container.
    pub(crate) async fn load(engine: Arc<EngineInner>, id: &str) -> Result<Arc<Self>, EngineError> {
        let config = engine.store.container_config(id).await?;
        let state = engine.store.container_state(id).await?;
        let lock = engine.lock_manager.retrieve(config.lock_id)?;
        Ok(Arc::new(Container {
            engine,
            config,
            state: Mutex::new(state),
            lock,
            valid: AtomicBool::new(true),
            batched: AtomicBool::new(false),
            pod_lock_held: AtomicBool::new(false),
        }))
    }

    // ── Accessors ─────────────────────────────────────────────

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn pod_id(&self) -> Option<&str> {
        self.config.pod_id.as_deref()
    }

    pub fn config(&self) -> &ContainerConfig {
        &self.config
    }

    /// Snapshot of the cached state. Callers wanting fresh data go through
    /// an operation that syncs first.
    pub fn state(&self) -> ContainerState {
        self.state.lock().clone()
    }

    pub fn status(&self) -> ContainerStatus {
        self.state.lock().state
    }

    pub(crate) fn oci(&self) -> Arc<dyn OciRuntime> {
        self.engine.runtime_for(&self.config.oci_runtime)
    }

    // ── Locking and sync ──────────────────────────────────────

    /// Take the entity lock unless a batched section already holds it.
    pub(crate) fn hold(&self) -> Option<locks::LockGuard<'_>> {
        if self.batched.load(Ordering::SeqCst) {
            None
        } else {
            Some(locks::lock_guard(self.lock.as_ref()))
        }
    }

    pub(crate) fn check_valid(&self) -> Result<(), EngineError> {
        if !self.valid.load(Ordering::SeqCst) {
            return Err(EngineError::CtrRemoved(self.config.id.clone()));
        }
        Ok(())
    }

    pub(crate) fn invalidate(&self) {
        self.valid.store(false, Ordering::SeqCst);
    }

    /// Reload state from the store and fold in what the monitor left
    /// behind: an exit file transitions Stopped → Exited and feeds the
    /// exit-code cache; a dead monitor without an exit file forces Stopped.
    pub(crate) async fn sync(&self) -> Result<(), EngineError> {
        self.check_valid()?;
        let mut state = match self.engine.store.container_state(&self.config.id).await {
            Ok(state) => state,
            Err(EngineError::NoSuchCtr(_)) => {
                self.invalidate();
                return Err(EngineError::CtrRemoved(self.config.id.clone()));
            }
            Err(e) => return Err(e),
        };

        if matches!(
            state.state,
            ContainerStatus::Running | ContainerStatus::Stopping | ContainerStatus::Stopped
        ) {
            let runtime = self.oci();
            match consume_exit_file(&runtime.exit_file_path(&self.config.id))? {
                Some(code) => {
                    state.state = ContainerStatus::Exited;
                    state.exit_code = code;
                    state.exited = true;
                    state.pid = 0;
                    if state.finished_time.is_none() {
                        state.finished_time = Some(Utc::now());
                    }
                    if runtime.oom_file_path(&self.config.id).exists() {
                        state.oom_killed = true;
                    }
                    self.engine
                        .store
                        .add_container_exit_code(&self.config.id, code)
                        .await?;
                    self.engine.store.save_container(&self.config.id, &state).await?;
                    self.engine
                        .event(
                            EventKind::Container,
                            EventStatus::Died,
                            &self.config.id,
                            &self.config.name,
                        )
                        .await;
                }
                None => {
                    if state.state != ContainerStatus::Stopped
                        && state.conmon_pid > 0
                        && !runtime.check_conmon_running(state.conmon_pid)
                    {
                        tracing::warn!(
                            ctr = self.config.id.as_str(),
                            conmon_pid = state.conmon_pid,
                            "container monitor has died without writing an exit file"
                        );
                        state.state = ContainerStatus::Stopped;
                        state.pid = 0;
                        self.engine.store.save_container(&self.config.id, &state).await?;
                    }
                }
            }
        }

        *self.state.lock() = state;
        Ok(())
    }

    /// Persist the cached state.
    pub(crate) async fn save(&self) -> Result<(), EngineError> {
        let state = self.state.lock().clone();
        self.engine.store.save_container(&self.config.id, &state).await
    }

    /// Run `func` inside a batched section: the entity lock is held once
    /// across every operation and implicit resync is suspended. Removal is
    /// forbidden while batched.
    pub async fn batch<F, Fut, R>(self: &Arc<Self>, func: F) -> Result<R, EngineError>
    where
        F: FnOnce(Arc<Self>) -> Fut,
        Fut: Future<Output = Result<R, EngineError>>,
    {
        self.check_valid()?;
        self.lock.lock();
        self.batched.store(true, Ordering::SeqCst);
        // One sync up front; operations inside see consistent state.
        let result = match self.sync().await {
            Ok(()) => func(Arc::clone(self)).await,
            Err(e) => Err(e),
        };
        self.batched.store(false, Ordering::SeqCst);
        self.lock.unlock();
        result
    }

    pub fn is_batched(&self) -> bool {
        self.batched.load(Ordering::SeqCst)
    }

    /// Fail unless the calling context may lock this container: members of
    /// a pod must be reached with the pod lock already held.
    pub(crate) fn check_lock_order(&self) -> Result<(), EngineError> {
        if self.config.pod_id.is_some() && !self.pod_lock_held.load(Ordering::SeqCst) {
            return Err(EngineError::WillDeadlock(format!(
                "container {} is in a pod; its pod lock must be taken first",
                self.config.id
            )));
        }
        Ok(())
    }

    pub(crate) fn mark_pod_lock_held(&self) {
        self.pod_lock_held.store(true, Ordering::SeqCst);
    }

    pub(crate) async fn emit(&self, status: EventStatus) {
        self.engine
            .event(EventKind::Container, status, &self.config.id, &self.config.name)
            .await;
    }
}
