//! Engine-level container operations — creation, removal, rename, and the
//! pod-ordered entry points for start/stop.
//!
//! Removal discipline: once past the commit point every step is attempted,
//! failures are logged, and the first error is surfaced at the end.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use chrono::Utc;

use crate::ctr::lifecycle::cgroups_v2;
use crate::ctr::Container;
use crate::entity::{ContainerConfig, ContainerState, ContainerStatus, VolumeConfig};
use crate::errors::EngineError;
use crate::events::{EventKind, EventStatus};
use crate::util::{anonymous_volume_name, new_id};

use super::{Engine, EngineInner};

#[derive(Debug, Clone, Copy, Default)]
pub struct RemoveOptions {
    /// Stop a live container instead of refusing.
    pub force: bool,
    /// Also remove named volumes that no other container uses. Anonymous
    /// volumes are always collected.
    pub remove_volumes: bool,
    /// Recursively remove dependent containers first.
    pub remove_deps: bool,
    /// Skip the dependent check entirely. Only the pod-remove path may set
    /// this: it removes members in reverse dependency order itself.
    pub(crate) ignore_deps: bool,
}

impl Engine {
    /// Create a container from a config template. The template's ID, lock,
    /// and creation time are assigned here; a lock is allocated before any
    /// database write. Anonymous volume entries (empty name) get generated
    /// volumes owned by this container.
    pub async fn new_container(
        &self,
        mut template: ContainerConfig,
    ) -> Result<Arc<Container>, EngineError> {
        self.inner.check_valid()?;

        template.id = new_id();
        if template.name.is_empty() {
            template.name = format!("ctr_{}", &template.id[..8]);
        }
        if template.name.contains('/') || template.name.contains(char::is_whitespace) {
            return Err(EngineError::InvalidArg(format!(
                "invalid container name \"{}\"",
                template.name
            )));
        }
        if template.namespace.is_empty() {
            template.namespace = self.inner.config.namespace.clone();
        }
        if template.oci_runtime.is_empty() {
            template.oci_runtime = self.inner.config.default_runtime.clone();
        }
        template.created_time = Utc::now();

        // Assign in-container interface names up front so later connects
        // see what is taken.
        let mut iface = 0u32;
        for opts in template.networks.values_mut() {
            if opts.interface_name.is_empty() {
                opts.interface_name = format!("eth{}", iface);
            }
            iface += 1;
        }

        // Materialize volumes before the container exists: anonymous ones
        // get generated names, named ones are created on first use.
        for named in &mut template.named_volumes {
            if named.name.is_empty() {
                named.name = anonymous_volume_name();
                named.is_anonymous = true;
            }
            if !self.inner.store.has_volume(&named.name).await? {
                self.new_volume(VolumeConfig {
                    name: named.name.clone(),
                    is_anon: named.is_anonymous,
                    ..Default::default()
                })
                .await?;
            }
        }

        let lock_id = self.inner.lock_manager.allocate()?;
        template.lock_id = lock_id;
        let state = ContainerState::default();

        let result = match template.pod_id.clone() {
            Some(pod_id) => {
                let pod = self.pod(&pod_id).await?;
                // Pod lock before any container work under it.
                let _pod_guard = locks::lock_guard(pod.lock.as_ref());
                let result = self
                    .inner
                    .store
                    .add_container_to_pod(&pod.config.id, &template, &state)
                    .await;
                if result.is_ok() && template.is_infra {
                    let mut pod_state = self.inner.store.pod_state(&pod.config.id).await?;
                    pod_state.infra_container_id = Some(template.id.clone());
                    self.inner.store.save_pod(&pod.config.id, &pod_state).await?;
                }
                result
            }
            None => self.inner.store.add_container(&template, &state).await,
        };
        if let Err(e) = result {
            if let Err(free_err) = self.inner.lock_manager.free(lock_id) {
                tracing::error!(lock = lock_id, error = %free_err, "cannot release lock after failed container create");
            }
            return Err(e);
        }

        if let Some(cid_file) = &template.cid_file {
            if let Err(e) = std::fs::write(cid_file, &template.id) {
                tracing::warn!(path = %cid_file.display(), error = %e, "cannot write container ID file");
            }
        }

        self.inner
            .event(
                EventKind::Container,
                EventStatus::Create,
                &template.id,
                &template.name,
            )
            .await;
        Container::load(Arc::clone(&self.inner), &template.id).await
    }

    /// Start a container through the correct lock order: the pod lock (when
    /// the container has one) strictly before the container lock.
    pub async fn start_container(&self, id_or_name: &str) -> Result<Arc<Container>, EngineError> {
        let ctr = self.container(id_or_name).await?;
        match ctr.pod_id() {
            Some(pod_id) => {
                let pod = self.pod(pod_id).await?;
                let _pod_guard = locks::lock_guard(pod.lock.as_ref());
                ctr.mark_pod_lock_held();
                ctr.start().await?;
            }
            None => ctr.start().await?,
        }
        Ok(ctr)
    }

    pub async fn stop_container(
        &self,
        id_or_name: &str,
        timeout: Option<u32>,
    ) -> Result<Arc<Container>, EngineError> {
        let ctr = self.container(id_or_name).await?;
        match ctr.pod_id() {
            Some(pod_id) => {
                let pod = self.pod(pod_id).await?;
                let _pod_guard = locks::lock_guard(pod.lock.as_ref());
                ctr.mark_pod_lock_held();
                ctr.stop(timeout).await?;
            }
            None => ctr.stop(timeout).await?,
        }
        Ok(ctr)
    }

    /// Remove a container. Returns `CtrRemoved` when the container is
    /// already gone, which user-facing callers treat as success.
    pub fn remove_container<'a>(
        &'a self,
        ctr: &'a Arc<Container>,
        opts: RemoveOptions,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), EngineError>> + Send + 'a>>
    {
        Box::pin(self.remove_container_impl(ctr, opts))
    }

    async fn remove_container_impl(
        &self,
        ctr: &Arc<Container>,
        opts: RemoveOptions,
    ) -> Result<(), EngineError> {
        self.inner.check_valid()?;
        if ctr.is_batched() {
            return Err(EngineError::InvalidArg(
                "cannot remove a container from inside its batched section".to_string(),
            ));
        }
        if ctr.config.is_infra && !opts.ignore_deps {
            return Err(EngineError::InvalidArg(format!(
                "container {} is an infra container and can only be removed with its pod",
                ctr.id()
            )));
        }

        // Pod lock first, then the container lock for the whole removal.
        let pod = match ctr.pod_id() {
            Some(pod_id) if !ctr.pod_lock_held.load(Ordering::SeqCst) => {
                Some(self.pod(pod_id).await?)
            }
            _ => None,
        };
        let _pod_guard = pod.as_ref().map(|p| locks::lock_guard(p.lock.as_ref()));
        if pod.is_some() {
            ctr.mark_pod_lock_held();
        }

        ctr.lock.lock();
        ctr.batched.store(true, Ordering::SeqCst);
        let result = self.remove_locked(ctr, opts).await;
        ctr.batched.store(false, Ordering::SeqCst);
        ctr.lock.unlock();
        result
    }

    async fn remove_locked(
        &self,
        ctr: &Arc<Container>,
        opts: RemoveOptions,
    ) -> Result<(), EngineError> {
        match ctr.sync().await {
            Ok(()) => {}
            Err(EngineError::CtrRemoved(id)) | Err(EngineError::NoSuchCtr(id)) => {
                // Idempotent: the double remove is a typed no-op.
                return Err(EngineError::CtrRemoved(id));
            }
            Err(e) => return Err(e),
        }

        let status = ctr.status();
        if status.is_live() || status == ContainerStatus::Paused {
            if !opts.force {
                return Err(EngineError::CtrStateInvalid {
                    id: ctr.id().to_string(),
                    state: status.to_string(),
                    msg: "cannot remove a running container without force".to_string(),
                });
            }
            // Paused containers on cgroup v1 must resume before signals can
            // reach them; v2 delivers SIGKILL directly.
            if status == ContainerStatus::Paused && !cgroups_v2() {
                ctr.oci().unpause_container(ctr.id()).await?;
            }
            match ctr.stop(Some(0)).await {
                Ok(()) => {}
                Err(e) if e.is_idempotent_success() => {}
                Err(e) => return Err(e),
            }
        }

        let dependents = self.inner.store.container_dependents(ctr.id()).await?;
        if !dependents.is_empty() && !opts.ignore_deps {
            if !opts.remove_deps {
                return Err(EngineError::DepExists {
                    id: ctr.id().to_string(),
                    deps: dependents.join(", "),
                });
            }
            for dependent in dependents {
                let handle = Container::load(Arc::clone(&self.inner), &dependent).await?;
                // Dependents share this container's pod, whose lock this
                // call already holds; the recursion must not retake it.
                if ctr.pod_lock_held.load(Ordering::SeqCst) && handle.pod_id() == ctr.pod_id() {
                    handle.mark_pod_lock_held();
                }
                // Boxed: removal recurses through dependents.
                let removal: std::pin::Pin<
                    Box<dyn std::future::Future<Output = Result<(), EngineError>> + Send + '_>,
                > = Box::pin(self.remove_container(&handle, opts));
                match removal.await {
                    Ok(()) => {}
                    Err(e) if e.is_idempotent_success() => {}
                    Err(e) => return Err(e),
                }
            }
        }

        // Commit point: from here every step runs, failures are logged, and
        // the first error is surfaced at the end.
        let mut first_err: Option<EngineError> = None;
        let mut keep = |step: &str, result: Result<(), EngineError>| {
            if let Err(e) = result {
                tracing::error!(ctr = ctr.id(), step, error = %e, "container removal step failed");
                if first_err.is_none() {
                    first_err = Some(e);
                }
            }
        };

        keep("network", ctr.teardown_network().await);
        self.inner.free_ports(ctr.id());
        if let Err(e) = ctr.oci().delete_container(ctr.id()).await {
            tracing::debug!(ctr = ctr.id(), error = %e, "runtime delete during removal");
        }
        keep("exec-sessions", ctr.exec_remove_all(true).await);

        {
            let mut state = ctr.state.lock();
            state.state = ContainerStatus::Removing;
        }
        keep("save-removing", ctr.save().await);

        keep("volumes", ctr.unmount_named_volumes().await);
        keep("storage", ctr.unmount_storage().await);

        let db_result = match ctr.pod_id() {
            Some(pod_id) => {
                self.inner
                    .store
                    .remove_container_from_pod(pod_id, ctr.id())
                    .await
            }
            None => self.inner.store.remove_container(ctr.id()).await,
        };
        keep("database", db_result);

        if let Some(cid_file) = &ctr.config.cid_file {
            if let Err(e) = std::fs::remove_file(cid_file) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(path = %cid_file.display(), error = %e, "cannot remove container ID file");
                }
            }
        }

        keep(
            "lock",
            self.inner
                .lock_manager
                .free(ctr.config.lock_id)
                .map_err(Into::into),
        );
        ctr.invalidate();
        ctr.emit(EventStatus::Remove).await;

        // Anonymous volumes die with their owning container; named volumes
        // only when asked and unused.
        for named in &ctr.config.named_volumes {
            if !named.is_anonymous && !opts.remove_volumes {
                continue;
            }
            match self.inner.volume(&named.name).await {
                Ok(volume) => match self.remove_volume(&volume, false).await {
                    Ok(()) => {}
                    // Transfer via volumes-from, or a race with another
                    // remover; both are fine.
                    Err(EngineError::VolumeBeingUsed { .. })
                    | Err(EngineError::NoSuchVolume(_))
                    | Err(EngineError::VolumeRemoved(_)) => {}
                    Err(e) => {
                        tracing::error!(volume = named.name.as_str(), error = %e, "volume cleanup after container removal failed");
                    }
                },
                Err(EngineError::NoSuchVolume(_)) => {}
                Err(e) => {
                    tracing::error!(volume = named.name.as_str(), error = %e, "cannot load volume for cleanup");
                }
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Post-exit cleanup entry point: release per-run resources, then honor
    /// auto-remove for containers that have exited.
    pub async fn cleanup_container(&self, ctr: &Arc<Container>) -> Result<(), EngineError> {
        ctr.cleanup().await?;
        if ctr.config.auto_remove && ctr.status() == ContainerStatus::Exited {
            match self
                .remove_container(
                    ctr,
                    RemoveOptions {
                        remove_volumes: true,
                        ..Default::default()
                    },
                )
                .await
            {
                Ok(()) => {}
                Err(e) if e.is_idempotent_success() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Rename a container through the safe rewrite path. Returns a fresh
    /// handle; the old one is invalidated.
    pub async fn rename_container(
        &self,
        ctr: &Arc<Container>,
        new_name: &str,
    ) -> Result<Arc<Container>, EngineError> {
        self.inner.check_valid()?;
        if new_name.is_empty() || new_name.contains('/') {
            return Err(EngineError::InvalidArg(format!(
                "invalid container name \"{}\"",
                new_name
            )));
        }

        let _guard = locks::lock_guard(ctr.lock.as_ref());
        ctr.sync().await?;

        let mut config = self.inner.store.container_config(ctr.id()).await?;
        let old_name = config.name.clone();
        config.name = new_name.to_string();
        self.inner
            .store
            .safe_rewrite_container_config(ctr.id(), &old_name, new_name, &config)
            .await?;
        ctr.invalidate();

        self.inner
            .event(EventKind::Container, EventStatus::Rename, ctr.id(), new_name)
            .await;
        Container::load(Arc::clone(&self.inner), ctr.id()).await
    }
}

impl EngineInner {
    /// Load a container handle; used by recursive engine paths.
    pub(crate) async fn container_handle(
        self: &Arc<Self>,
        id: &str,
    ) -> Result<Arc<Container>, EngineError> {
        Container::load(Arc::clone(self), id).await
    }
}
