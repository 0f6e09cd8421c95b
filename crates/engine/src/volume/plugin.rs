//! Volume plug-in driver — dispatches to an external helper executable.
//!
//! The helper speaks a one-shot JSON protocol: it receives
//! `{"op": "...", "name": "...", "options": {...}}` on stdin and answers
//! `{"mountpoint": "..."}` (or nothing) on stdout. A non-zero exit is the
//! driver's error, surfaced verbatim.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::entity::VolumeConfig;
use crate::errors::EngineError;

use super::VolumeDriver;

/// Default timeout for a plug-in call when the volume carries none.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Serialize)]
struct PluginRequest<'a> {
    op: &'a str,
    name: &'a str,
    options: &'a std::collections::HashMap<String, String>,
}

#[derive(Deserialize, Default)]
struct PluginResponse {
    #[serde(default)]
    mountpoint: String,
}

pub struct PluginDriver {
    name: String,
    executable: PathBuf,
}

impl PluginDriver {
    pub fn new(name: String, executable: PathBuf) -> Self {
        PluginDriver { name, executable }
    }

    async fn call(
        &self,
        op: &str,
        config: &VolumeConfig,
    ) -> Result<PluginResponse, EngineError> {
        let request = serde_json::to_vec(&PluginRequest {
            op,
            name: &config.name,
            options: &config.options,
        })?;

        let timeout = config
            .timeout
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_TIMEOUT);

        let mut child = Command::new(&self.executable)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                EngineError::MissingPlugin(format!("{} ({}): {}", self.name, self.executable.display(), e))
            })?;
        if let Some(stdin) = child.stdin.as_mut() {
            stdin.write_all(&request).await?;
        }
        drop(child.stdin.take());

        let output = tokio::time::timeout(timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                EngineError::Internal(format!(
                    "volume plugin {} timed out after {:?} in {}",
                    self.name, timeout, op
                ))
            })??;

        if !output.status.success() {
            return Err(EngineError::Internal(format!(
                "volume plugin {} failed in {}: {}",
                self.name,
                op,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        if output.stdout.is_empty() {
            return Ok(PluginResponse::default());
        }
        Ok(serde_json::from_slice(&output.stdout)?)
    }
}

#[async_trait]
impl VolumeDriver for PluginDriver {
    async fn create(&self, config: &VolumeConfig) -> Result<(), EngineError> {
        self.call("create", config).await.map(|_| ())
    }

    async fn remove(&self, config: &VolumeConfig) -> Result<(), EngineError> {
        self.call("remove", config).await.map(|_| ())
    }

    async fn mount(&self, config: &VolumeConfig) -> Result<PathBuf, EngineError> {
        let response = self.call("mount", config).await?;
        if response.mountpoint.is_empty() {
            return Err(EngineError::Internal(format!(
                "volume plugin {} returned no mount point for {}",
                self.name, config.name
            )));
        }
        Ok(PathBuf::from(response.mountpoint))
    }

    async fn unmount(&self, config: &VolumeConfig) -> Result<(), EngineError> {
        self.call("unmount", config).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_executable_is_typed() {
        let driver = PluginDriver::new(
            "ghost".to_string(),
            PathBuf::from("/nonexistent/plugin-helper"),
        );
        let config = VolumeConfig {
            name: "v".to_string(),
            driver: "ghost".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            driver.create(&config).await,
            Err(EngineError::MissingPlugin(_))
        ));
    }

    #[tokio::test]
    async fn test_mount_via_shell_helper() {
        // `cat` echoes the request back; it has no "mountpoint" key, so the
        // driver reports a missing mount point rather than crashing.
        let driver = PluginDriver::new("cat".to_string(), PathBuf::from("/bin/cat"));
        let config = VolumeConfig {
            name: "v".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            driver.mount(&config).await,
            Err(EngineError::Internal(_))
        ));
    }
}
