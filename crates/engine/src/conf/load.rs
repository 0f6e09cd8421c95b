//! Load — config file discovery and environment overrides.
//!
//! Priority: caller overrides > environment variables > config file > defaults.
//! Caller overrides are applied by the engine at bootstrap, after this loader
//! has produced the file/env merge.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use super::model::{EngineConfig, LockBackend, StateBackend};

/// Load configuration from file or environment variables.
pub fn load() -> Result<EngineConfig, Box<dyn std::error::Error>> {
    let config_path = std::env::var("ENGINE_CONFIG_FILE")
        .unwrap_or_else(|_| "/etc/engine/engine.toml".to_string());

    let mut config = if Path::new(&config_path).exists() {
        tracing::info!("Loading configuration from: {}", config_path);
        from_file(&config_path)?
    } else {
        tracing::debug!(
            "Config file not found at {}, using built-in defaults",
            config_path
        );
        EngineConfig::default()
    };

    apply_env(&mut config);
    Ok(config)
}

/// Load configuration from a TOML file, with defaults for absent keys.
pub fn from_file(path: &str) -> Result<EngineConfig, Box<dyn std::error::Error>> {
    let mut file = File::open(path)?;
    let mut contents = String::new();
    file.read_to_string(&mut contents)?;

    let config: EngineConfig = toml::from_str(&contents)?;
    Ok(config)
}

/// Environment variables override file config for critical settings.
pub fn apply_env(config: &mut EngineConfig) {
    if let Ok(dir) = std::env::var("ENGINE_STATIC_DIR") {
        config.static_dir = PathBuf::from(dir);
    }
    if let Ok(dir) = std::env::var("ENGINE_TMP_DIR") {
        config.tmp_dir = PathBuf::from(dir);
    }
    if let Ok(dir) = std::env::var("ENGINE_RUN_ROOT") {
        config.run_root = PathBuf::from(dir);
    }
    if let Ok(dir) = std::env::var("ENGINE_GRAPH_ROOT") {
        config.graph_root = PathBuf::from(&dir);
        config.volume_path = PathBuf::from(dir).join("volumes");
    }
    if let Ok(dir) = std::env::var("ENGINE_VOLUME_PATH") {
        config.volume_path = PathBuf::from(dir);
    }
    if let Ok(backend) = std::env::var("ENGINE_STATE_BACKEND") {
        match backend.as_str() {
            "kv" => config.state_backend = StateBackend::Kv,
            "sqlite" => config.state_backend = StateBackend::Sqlite,
            "" | "default" => config.state_backend = StateBackend::Default,
            other => tracing::warn!("Ignoring unknown ENGINE_STATE_BACKEND value: {}", other),
        }
    }
    if let Ok(backend) = std::env::var("ENGINE_LOCK_BACKEND") {
        match backend.as_str() {
            "shm" => config.lock_backend = LockBackend::Shm,
            "file" => config.lock_backend = LockBackend::File,
            other => tracing::warn!("Ignoring unknown ENGINE_LOCK_BACKEND value: {}", other),
        }
    }
    if let Ok(runtime) = std::env::var("ENGINE_RUNTIME") {
        config.default_runtime = runtime;
    }
    if let Ok(n) = std::env::var("ENGINE_NUM_LOCKS") {
        if let Ok(n) = n.parse() {
            config.num_locks = n;
        }
    }
    if let Ok(backend) = std::env::var("ENGINE_EVENTS_BACKEND") {
        config.events_backend = backend;
    }
    if let Ok(ns) = std::env::var("ENGINE_NAMESPACE") {
        config.namespace = ns;
    }
}

/// Initialise the tracing / logging subsystem.
pub fn init_logging() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "engine=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_file_partial_keys() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("engine.toml");
        std::fs::write(
            &path,
            r#"
static_dir = "/custom/state"
state_backend = "sqlite"
num_locks = 512
"#,
        )
        .unwrap();

        let config = from_file(path.to_str().unwrap()).unwrap();
        assert_eq!(config.static_dir, PathBuf::from("/custom/state"));
        assert_eq!(config.state_backend, StateBackend::Sqlite);
        assert_eq!(config.num_locks, 512);
        // Unspecified keys keep their defaults.
        assert_eq!(config.stop_timeout, 10);
    }
}
