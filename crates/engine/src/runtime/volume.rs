//! Engine-level volume operations — create, remove, mount accounting, and
//! the cascades (force removal of users, image-backed volume cleanup).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;

use crate::entity::{VolumeConfig, VolumeState};
use crate::errors::EngineError;
use crate::events::{EventKind, EventStatus};
use crate::util::anonymous_volume_name;

use super::ctr::RemoveOptions;
use super::{Engine, EngineInner};

pub struct Volume {
    pub(crate) engine: Arc<EngineInner>,
    pub(crate) config: VolumeConfig,
    pub(crate) state: Mutex<VolumeState>,
    pub(crate) lock: Box<dyn locks::EntityLock>,
    pub(crate) valid: AtomicBool,
}

impl Volume {
    pub(crate) async fn load(
        engine: Arc<EngineInner>,
        name: &str,
    ) -> Result<Arc<Self>, EngineError> {
        let config = engine.store.volume_config(name).await?;
        let state = engine.store.volume_state(name).await?;
        let lock = engine.lock_manager.retrieve(config.lock_id)?;
        Ok(Arc::new(Volume {
            engine,
            config,
            state: Mutex::new(state),
            lock,
            valid: AtomicBool::new(true),
        }))
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &VolumeConfig {
        &self.config
    }

    pub fn state(&self) -> VolumeState {
        self.state.lock().clone()
    }

    pub fn is_anonymous(&self) -> bool {
        self.config.is_anon
    }

    fn check_valid(&self) -> Result<(), EngineError> {
        if !self.valid.load(Ordering::SeqCst) {
            return Err(EngineError::VolumeRemoved(self.config.name.clone()));
        }
        Ok(())
    }

    async fn sync(&self) -> Result<(), EngineError> {
        self.check_valid()?;
        match self.engine.store.volume_state(&self.config.name).await {
            Ok(state) => {
                *self.state.lock() = state;
                Ok(())
            }
            Err(EngineError::NoSuchVolume(_)) => {
                self.valid.store(false, Ordering::SeqCst);
                Err(EngineError::VolumeRemoved(self.config.name.clone()))
            }
            Err(e) => Err(e),
        }
    }

    /// Container IDs referencing this volume.
    pub async fn users(&self) -> Result<Vec<String>, EngineError> {
        self.engine.store.volume_users(&self.config.name).await
    }

    /// Increment the mount count, actually mounting on the 0→1 edge. The
    /// one-shot copy-up/chown flags are consumed on first mount.
    pub async fn mount(&self) -> Result<String, EngineError> {
        let _guard = locks::lock_guard(self.lock.as_ref());
        self.sync().await?;

        let driver = self.engine.volume_drivers.driver_for(&self.config)?;
        let mut state = self.state();
        state.mount_count += 1;
        if state.mount_count == 1 {
            let mount_point = driver.mount(&self.config).await?;
            state.mount_point = mount_point.to_string_lossy().into_owned();
            if state.needs_copy_up {
                tracing::debug!(
                    volume = self.config.name.as_str(),
                    "first mount: image contents will be copied up by the storage backend"
                );
                state.needs_copy_up = false;
            }
            if state.needs_chown {
                tracing::debug!(
                    volume = self.config.name.as_str(),
                    uid = self.config.uid,
                    gid = self.config.gid,
                    "first use: adjusting volume ownership"
                );
                state.needs_chown = false;
            }
        }
        let mount_point = if state.mount_point.is_empty() {
            self.config.mount_point.clone()
        } else {
            state.mount_point.clone()
        };
        *self.state.lock() = state.clone();
        self.engine.store.save_volume(&self.config.name, &state).await?;
        Ok(mount_point)
    }

    /// Decrement the mount count, unmounting on the 1→0 edge.
    pub async fn unmount(&self) -> Result<(), EngineError> {
        let _guard = locks::lock_guard(self.lock.as_ref());
        self.sync().await?;

        let mut state = self.state();
        if state.mount_count == 0 {
            return Ok(());
        }
        state.mount_count -= 1;
        if state.mount_count == 0 {
            let driver = self.engine.volume_drivers.driver_for(&self.config)?;
            driver.unmount(&self.config).await?;
            state.mount_point = String::new();
        }
        *self.state.lock() = state.clone();
        self.engine.store.save_volume(&self.config.name, &state).await
    }
}

impl EngineInner {
    pub(crate) async fn volume(self: &Arc<Self>, name: &str) -> Result<Arc<Volume>, EngineError> {
        Volume::load(Arc::clone(self), name).await
    }
}

impl Engine {
    /// Create a named volume. An empty name produces an anonymous volume.
    /// The lock is allocated before the driver call and database write.
    pub async fn new_volume(&self, mut template: VolumeConfig) -> Result<Arc<Volume>, EngineError> {
        self.inner.check_valid()?;

        if template.name.is_empty() {
            template.name = anonymous_volume_name();
            template.is_anon = true;
        }
        if template.name.contains('/') || template.name.contains(char::is_whitespace) {
            return Err(EngineError::InvalidArg(format!(
                "invalid volume name \"{}\"",
                template.name
            )));
        }
        if template.driver.is_empty() {
            template.driver = crate::volume::LOCAL_DRIVER.to_string();
        }
        template.created_time = Utc::now();

        let lock_id = self.inner.lock_manager.allocate()?;
        template.lock_id = lock_id;

        let result = self.create_volume_backing(&mut template).await;
        if let Err(e) = result {
            if let Err(free_err) = self.inner.lock_manager.free(lock_id) {
                tracing::error!(lock = lock_id, error = %free_err, "cannot release lock after failed volume create");
            }
            return Err(e);
        }

        self.inner
            .event(
                EventKind::Volume,
                EventStatus::Create,
                &template.name,
                &template.name,
            )
            .await;
        Volume::load(Arc::clone(&self.inner), &template.name).await
    }

    async fn create_volume_backing(&self, template: &mut VolumeConfig) -> Result<(), EngineError> {
        let driver = self.inner.volume_drivers.driver_for(template)?;
        driver.create(template).await?;
        if template.mount_point.is_empty() && !template.uses_plugin() {
            template.mount_point = self
                .inner
                .volume_drivers
                .local()
                .data_dir(&template.name)
                .to_string_lossy()
                .into_owned();
        }

        let state = VolumeState {
            needs_copy_up: true,
            needs_chown: true,
            ..Default::default()
        };
        if let Err(e) = self.inner.store.add_volume(template, &state).await {
            // Roll the driver state back; the database is untouched.
            if let Err(remove_err) = driver.remove(template).await {
                tracing::error!(volume = template.name.as_str(), error = %remove_err, "cannot undo driver create after failed volume add");
            }
            return Err(e);
        }
        Ok(())
    }

    /// Remove a volume. Referenced volumes are refused unless `force`,
    /// which removes the referencing containers first.
    pub async fn remove_volume(&self, volume: &Arc<Volume>, force: bool) -> Result<(), EngineError> {
        self.inner.check_valid()?;
        volume.check_valid()?;

        let users = volume.users().await?;
        if !users.is_empty() {
            if !force {
                return Err(EngineError::VolumeBeingUsed {
                    name: volume.name().to_string(),
                    users: users.join(", "),
                });
            }
            for user in users {
                let handle = match self.inner.container_handle(&user).await {
                    Ok(handle) => handle,
                    Err(EngineError::NoSuchCtr(_)) => continue,
                    Err(e) => return Err(e),
                };
                // Boxed: container removal and volume removal recurse into
                // each other through force paths and anonymous GC.
                let removal: std::pin::Pin<
                    Box<dyn std::future::Future<Output = Result<(), EngineError>> + Send + '_>,
                > = Box::pin(self.remove_container(
                    &handle,
                    RemoveOptions {
                        force: true,
                        remove_volumes: false,
                        ..Default::default()
                    },
                ));
                match removal.await {
                    Ok(()) => {}
                    Err(e) if e.is_idempotent_success() => {}
                    Err(e) => return Err(e),
                }
            }
        }

        let _guard = locks::lock_guard(volume.lock.as_ref());
        match volume.sync().await {
            Ok(()) => {}
            Err(EngineError::VolumeRemoved(name)) => return Err(EngineError::VolumeRemoved(name)),
            Err(e) => return Err(e),
        }

        let mut first_err: Option<EngineError> = None;
        let driver = self.inner.volume_drivers.driver_for(&volume.config)?;
        if volume.state().mount_count > 0 {
            if let Err(e) = driver.unmount(&volume.config).await {
                tracing::error!(volume = volume.name(), error = %e, "volume unmount during removal failed");
                first_err.get_or_insert(e);
            }
        }
        if let Err(e) = driver.remove(&volume.config).await {
            tracing::error!(volume = volume.name(), error = %e, "volume driver removal failed");
            first_err.get_or_insert(e);
        }

        if let Err(e) = self.inner.store.remove_volume(volume.name()).await {
            tracing::error!(volume = volume.name(), error = %e, "volume database removal failed");
            first_err.get_or_insert(e);
        }
        if let Err(e) = self.inner.lock_manager.free(volume.config.lock_id) {
            tracing::error!(volume = volume.name(), error = %e, "cannot release volume lock");
        }
        volume.valid.store(false, Ordering::SeqCst);

        self.inner
            .event(
                EventKind::Volume,
                EventStatus::Remove,
                volume.name(),
                volume.name(),
            )
            .await;
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Cascade for image removal: delete every image-backed pseudo-volume
    /// whose backing storage container belongs to the removed image.
    pub async fn remove_image_volumes(&self, storage_id: &str) -> Result<(), EngineError> {
        self.inner.check_valid()?;
        for (config, _) in self.inner.store.all_volumes().await? {
            if !config.storage_id.is_empty() && config.storage_id == storage_id {
                let volume = self.inner.volume(&config.name).await?;
                match self.remove_volume(&volume, true).await {
                    Ok(()) => {}
                    Err(EngineError::NoSuchVolume(_)) | Err(EngineError::VolumeRemoved(_)) => {}
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(())
    }
}
