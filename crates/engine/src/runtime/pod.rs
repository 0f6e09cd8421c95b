//! Pods — shared-namespace container groups and their ordered operations.
//!
//! Start visits the dependency graph roots first; stop and remove visit
//! them last. Per-container failures accumulate in a map keyed by ID and
//! surface as one partial-failure error.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;

use crate::ctr::Container;
use crate::entity::{PodConfig, PodState};
use crate::errors::EngineError;
use crate::events::{EventKind, EventStatus};
use crate::graph::DepGraph;
use crate::util::new_id;

use super::ctr::RemoveOptions;
use super::{Engine, EngineInner};

pub struct Pod {
    pub(crate) engine: Arc<EngineInner>,
    pub(crate) config: PodConfig,
    pub(crate) state: Mutex<PodState>,
    pub(crate) lock: Box<dyn locks::EntityLock>,
    pub(crate) valid: AtomicBool,
}

impl Pod {
    pub(crate) async fn load(engine: Arc<EngineInner>, id: &str) -> Result<Arc<Self>, EngineError> {
        let config = engine.store.pod_config(id).await?;
        let state = engine.store.pod_state(id).await?;
        let lock = engine.lock_manager.retrieve(config.lock_id)?;
        Ok(Arc::new(Pod {
            engine,
            config,
            state: Mutex::new(state),
            lock,
            valid: AtomicBool::new(true),
        }))
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &PodConfig {
        &self.config
    }

    pub fn state(&self) -> PodState {
        self.state.lock().clone()
    }

    pub fn infra_container_id(&self) -> Option<String> {
        self.state.lock().infra_container_id.clone()
    }

    pub(crate) fn check_valid(&self) -> Result<(), EngineError> {
        if !self.valid.load(Ordering::SeqCst) {
            return Err(EngineError::PodRemoved(self.config.id.clone()));
        }
        Ok(())
    }

    pub(crate) async fn sync(&self) -> Result<(), EngineError> {
        self.check_valid()?;
        match self.engine.store.pod_state(&self.config.id).await {
            Ok(state) => {
                *self.state.lock() = state;
                Ok(())
            }
            Err(EngineError::NoSuchPod(_)) => {
                self.valid.store(false, Ordering::SeqCst);
                Err(EngineError::PodRemoved(self.config.id.clone()))
            }
            Err(e) => Err(e),
        }
    }

    /// Member container IDs, from the store.
    pub async fn container_ids(&self) -> Result<Vec<String>, EngineError> {
        self.engine.store.pod_containers(&self.config.id).await
    }

    /// Load handles for every member, marked as reachable under the pod
    /// lock. Handles that fail to load are returned as errors by ID so
    /// callers can fall back to best-effort iteration.
    async fn member_handles(
        &self,
    ) -> Result<(Vec<Arc<Container>>, HashMap<String, EngineError>), EngineError> {
        let mut handles = Vec::new();
        let mut failures = HashMap::new();
        for id in self.container_ids().await? {
            match Container::load(Arc::clone(&self.engine), &id).await {
                Ok(handle) => {
                    handle.mark_pod_lock_held();
                    handles.push(handle);
                }
                Err(e) => {
                    failures.insert(id, e);
                }
            }
        }
        Ok((handles, failures))
    }

    /// Start every member in dependency order. Containers whose
    /// prerequisites failed are not visited and report a dependency error.
    pub async fn start(&self) -> Result<(), EngineError> {
        self.check_valid()?;
        let _guard = locks::lock_guard(self.lock.as_ref());
        self.sync().await?;

        let (handles, mut errors) = self.member_handles().await?;
        if !errors.is_empty() {
            tracing::warn!(
                pod = self.config.id.as_str(),
                failed = errors.len(),
                "some pod members failed to load; starting the rest unordered"
            );
        }
        let by_id: HashMap<String, Arc<Container>> = handles
            .iter()
            .map(|h| (h.id().to_string(), Arc::clone(h)))
            .collect();

        // A cycle fails the whole operation before any container starts.
        let graph = DepGraph::build(
            handles
                .iter()
                .map(|h| (h.id().to_string(), h.config().dependencies.clone())),
        )?;

        let mut blocked: std::collections::HashSet<String> = Default::default();
        for id in graph.start_order() {
            if blocked.contains(&id) {
                errors.insert(
                    id.clone(),
                    EngineError::Internal(
                        "a dependency of this container failed to start".to_string(),
                    ),
                );
                continue;
            }
            let handle = &by_id[&id];
            if let Err(e) = handle.start().await {
                blocked.extend(graph.blocked_by(&id));
                errors.insert(id, e);
            }
        }

        self.engine
            .event(
                EventKind::Pod,
                EventStatus::Start,
                &self.config.id,
                &self.config.name,
            )
            .await;
        if errors.is_empty() {
            Ok(())
        } else {
            Err(EngineError::PodPartialFail(errors))
        }
    }

    /// Stop every member in reverse dependency order. Already-stopped
    /// members count as success.
    pub async fn stop(&self, timeout: Option<u32>) -> Result<(), EngineError> {
        self.check_valid()?;
        let _guard = locks::lock_guard(self.lock.as_ref());
        self.sync().await?;

        let (handles, mut errors) = self.member_handles().await?;
        let by_id: HashMap<String, Arc<Container>> = handles
            .iter()
            .map(|h| (h.id().to_string(), Arc::clone(h)))
            .collect();

        let order = match DepGraph::build(
            handles
                .iter()
                .map(|h| (h.id().to_string(), h.config().dependencies.clone())),
        ) {
            Ok(graph) => graph.stop_order(),
            Err(e) => {
                // Stop is best-effort: fall back to unordered iteration.
                tracing::warn!(pod = self.config.id.as_str(), error = %e, "dependency graph build failed; stopping unordered");
                handles.iter().map(|h| h.id().to_string()).collect()
            }
        };

        for id in order {
            let handle = &by_id[&id];
            match handle.stop(timeout).await {
                Ok(()) => {}
                Err(e) if e.is_idempotent_success() => {}
                Err(e) => {
                    errors.insert(id, e);
                }
            }
        }

        self.engine
            .event(
                EventKind::Pod,
                EventStatus::Stop,
                &self.config.id,
                &self.config.name,
            )
            .await;
        if errors.is_empty() {
            Ok(())
        } else {
            Err(EngineError::PodPartialFail(errors))
        }
    }
}

impl Engine {
    /// Create a pod. A lock is allocated before the database write.
    pub async fn new_pod(&self, mut template: PodConfig) -> Result<Arc<Pod>, EngineError> {
        self.inner.check_valid()?;

        template.id = new_id();
        if template.name.is_empty() {
            template.name = format!("pod_{}", &template.id[..8]);
        }
        if template.name.contains('/') || template.name.contains(char::is_whitespace) {
            return Err(EngineError::InvalidArg(format!(
                "invalid pod name \"{}\"",
                template.name
            )));
        }
        if template.namespace.is_empty() {
            template.namespace = self.inner.config.namespace.clone();
        }
        template.created_time = Utc::now();

        let lock_id = self.inner.lock_manager.allocate()?;
        template.lock_id = lock_id;

        let mut state = PodState::default();
        if template.use_pod_cgroup {
            let parent = if template.cgroup_parent.is_empty() {
                "engine.slice"
            } else {
                &template.cgroup_parent
            };
            state.cgroup_path = format!("{}/{}", parent, template.id);
        }

        if let Err(e) = self.inner.store.add_pod(&template, &state).await {
            if let Err(free_err) = self.inner.lock_manager.free(lock_id) {
                tracing::error!(lock = lock_id, error = %free_err, "cannot release lock after failed pod create");
            }
            return Err(e);
        }

        self.inner
            .event(EventKind::Pod, EventStatus::Create, &template.id, &template.name)
            .await;
        Pod::load(Arc::clone(&self.inner), &template.id).await
    }

    /// Remove a pod and all of its containers, members first in reverse
    /// dependency order, infra last. Per-container failures are collected
    /// under `RemovingCtrs`.
    pub async fn remove_pod(&self, pod: &Arc<Pod>, force: bool) -> Result<(), EngineError> {
        self.inner.check_valid()?;
        pod.check_valid()?;
        let _guard = locks::lock_guard(pod.lock.as_ref());
        match pod.sync().await {
            Ok(()) => {}
            Err(EngineError::PodRemoved(id)) => return Err(EngineError::PodRemoved(id)),
            Err(e) => return Err(e),
        }

        let (handles, load_failures) = pod.member_handles().await?;
        let by_id: HashMap<String, Arc<Container>> = handles
            .iter()
            .map(|h| (h.id().to_string(), Arc::clone(h)))
            .collect();

        let order = match DepGraph::build(
            handles
                .iter()
                .map(|h| (h.id().to_string(), h.config().dependencies.clone())),
        ) {
            Ok(graph) => graph.stop_order(),
            Err(e) => {
                tracing::warn!(pod = pod.id(), error = %e, "dependency graph build failed; removing unordered");
                handles.iter().map(|h| h.id().to_string()).collect()
            }
        };

        let mut errors: HashMap<String, EngineError> = load_failures;
        for id in order {
            let handle = &by_id[&id];
            let opts = RemoveOptions {
                force,
                remove_volumes: true,
                remove_deps: false,
                ignore_deps: true,
            };
            match self.remove_container(handle, opts).await {
                Ok(()) => {}
                Err(e) if e.is_idempotent_success() => {}
                Err(e) => {
                    errors.insert(id, e);
                }
            }
        }
        if !errors.is_empty() {
            return Err(EngineError::RemovingCtrs(errors));
        }

        self.inner.store.remove_pod(pod.id()).await?;
        if let Err(e) = self.inner.lock_manager.free(pod.config.lock_id) {
            tracing::error!(pod = pod.id(), error = %e, "cannot release pod lock");
        }
        pod.valid.store(false, Ordering::SeqCst);
        self.inner
            .event(EventKind::Pod, EventStatus::Remove, pod.id(), pod.name())
            .await;
        Ok(())
    }

    /// Start a pod by name or ID.
    pub async fn start_pod(&self, id_or_name: &str) -> Result<Arc<Pod>, EngineError> {
        let pod = self.pod(id_or_name).await?;
        pod.start().await?;
        Ok(pod)
    }

    /// Stop a pod by name or ID.
    pub async fn stop_pod(
        &self,
        id_or_name: &str,
        timeout: Option<u32>,
    ) -> Result<Arc<Pod>, EngineError> {
        let pod = self.pod(id_or_name).await?;
        pod.stop(timeout).await?;
        Ok(pod)
    }
}
