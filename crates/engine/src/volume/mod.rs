//! Volume domain — driver dispatch for named volumes.
//!
//! The built-in local driver keeps payloads under
//! `<volume_path>/<name>/_data`. Anything else goes through a driver
//! plug-in; an unknown driver name is a typed `MissingPlugin` failure.

pub mod plugin;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;

use crate::entity::VolumeConfig;
use crate::errors::EngineError;

pub use plugin::PluginDriver;

pub const LOCAL_DRIVER: &str = "local";

#[async_trait]
pub trait VolumeDriver: Send + Sync {
    async fn create(&self, config: &VolumeConfig) -> Result<(), EngineError>;
    async fn remove(&self, config: &VolumeConfig) -> Result<(), EngineError>;
    /// Make the volume available; returns the host mount point.
    async fn mount(&self, config: &VolumeConfig) -> Result<PathBuf, EngineError>;
    async fn unmount(&self, config: &VolumeConfig) -> Result<(), EngineError>;
}

/// The built-in driver: plain directories, no mount magic.
pub struct LocalDriver {
    volume_path: PathBuf,
}

impl LocalDriver {
    pub fn new(volume_path: PathBuf) -> Self {
        LocalDriver { volume_path }
    }

    pub fn data_dir(&self, name: &str) -> PathBuf {
        self.volume_path.join(name).join("_data")
    }
}

#[async_trait]
impl VolumeDriver for LocalDriver {
    async fn create(&self, config: &VolumeConfig) -> Result<(), EngineError> {
        let data = self.data_dir(&config.name);
        std::fs::create_dir_all(&data)?;
        Ok(())
    }

    async fn remove(&self, config: &VolumeConfig) -> Result<(), EngineError> {
        match std::fs::remove_dir_all(self.volume_path.join(&config.name)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn mount(&self, config: &VolumeConfig) -> Result<PathBuf, EngineError> {
        let data = self.data_dir(&config.name);
        if !data.is_dir() {
            return Err(EngineError::Internal(format!(
                "volume {} is missing its data directory {}",
                config.name,
                data.display()
            )));
        }
        Ok(data)
    }

    async fn unmount(&self, _config: &VolumeConfig) -> Result<(), EngineError> {
        Ok(())
    }
}

/// Driver registry: the local driver plus any configured plug-ins.
pub struct DriverRegistry {
    local: Arc<LocalDriver>,
    plugins: HashMap<String, Arc<dyn VolumeDriver>>,
}

impl DriverRegistry {
    pub fn new(volume_path: PathBuf) -> Self {
        DriverRegistry {
            local: Arc::new(LocalDriver::new(volume_path)),
            plugins: HashMap::new(),
        }
    }

    pub fn register(&mut self, name: &str, driver: Arc<dyn VolumeDriver>) {
        self.plugins.insert(name.to_string(), driver);
    }

    pub fn local(&self) -> Arc<LocalDriver> {
        Arc::clone(&self.local)
    }

    /// Resolve the driver for a volume config.
    pub fn driver_for(&self, config: &VolumeConfig) -> Result<Arc<dyn VolumeDriver>, EngineError> {
        if config.driver.is_empty() || config.driver == LOCAL_DRIVER {
            return Ok(self.local.clone());
        }
        self.plugins
            .get(&config.driver)
            .cloned()
            .ok_or_else(|| EngineError::MissingPlugin(config.driver.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_local_driver_layout() {
        let dir = TempDir::new().unwrap();
        let driver = LocalDriver::new(dir.path().to_path_buf());
        let config = VolumeConfig {
            name: "data".to_string(),
            ..Default::default()
        };

        driver.create(&config).await.unwrap();
        let data = dir.path().join("data/_data");
        assert!(data.is_dir());
        assert_eq!(driver.mount(&config).await.unwrap(), data);

        driver.remove(&config).await.unwrap();
        assert!(!dir.path().join("data").exists());
        // Idempotent.
        driver.remove(&config).await.unwrap();
    }

    #[test]
    fn test_registry_dispatch() {
        let dir = TempDir::new().unwrap();
        let registry = DriverRegistry::new(dir.path().to_path_buf());

        let local = VolumeConfig::default();
        assert!(registry.driver_for(&local).is_ok());

        let plugged = VolumeConfig {
            driver: "nfs".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            registry.driver_for(&plugged),
            Err(EngineError::MissingPlugin(_))
        ));
    }
}
