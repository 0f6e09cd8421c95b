//! Helper-process network backend — drives an external netavark-compatible
//! binary with JSON over stdin/stdout.
//!
//! Protocol: `helper setup <netns>` / `helper teardown <netns>` with
//! `{"container_id", "container_name", "port_mappings", "networks"}` on
//! stdin; setup answers a map of network name → status JSON. Inspection
//! goes through `helper inspect <name>` and `helper list`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::entity::NetworkStatus;
use crate::errors::EngineError;

use super::backend::{NetworkBackend, NetworkInfo, SetupOptions};

pub struct HelperBackend {
    executable: PathBuf,
}

#[derive(Deserialize)]
struct HelperNetwork {
    name: String,
    #[serde(default)]
    id: String,
    #[serde(default)]
    driver: String,
    #[serde(default)]
    dns_enabled: bool,
    #[serde(default)]
    gateway: Option<String>,
}

impl HelperBackend {
    pub fn new(executable: PathBuf) -> Self {
        HelperBackend { executable }
    }

    async fn invoke(
        &self,
        args: &[&str],
        stdin_payload: Option<Vec<u8>>,
    ) -> Result<Vec<u8>, EngineError> {
        let mut cmd = Command::new(&self.executable);
        cmd.args(args)
            .stdin(if stdin_payload.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|e| {
            EngineError::Internal(format!(
                "cannot run network helper {}: {}",
                self.executable.display(),
                e
            ))
        })?;
        if let Some(payload) = stdin_payload {
            if let Some(stdin) = child.stdin.as_mut() {
                stdin.write_all(&payload).await?;
            }
            drop(child.stdin.take());
        }
        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(EngineError::Internal(format!(
                "network helper {} failed: {}",
                args.first().unwrap_or(&""),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(output.stdout)
    }

    fn payload(opts: &SetupOptions) -> Result<Vec<u8>, EngineError> {
        Ok(serde_json::to_vec(&json!({
            "container_id": opts.container_id,
            "container_name": opts.container_name,
            "port_mappings": opts.port_mappings,
            "networks": opts.networks,
        }))?)
    }
}

#[async_trait]
impl NetworkBackend for HelperBackend {
    async fn setup(
        &self,
        netns: &str,
        opts: &SetupOptions,
    ) -> Result<HashMap<String, NetworkStatus>, EngineError> {
        let stdout = self
            .invoke(&["setup", netns], Some(Self::payload(opts)?))
            .await?;
        Ok(serde_json::from_slice(&stdout)?)
    }

    async fn teardown(&self, netns: &str, opts: &SetupOptions) -> Result<(), EngineError> {
        self.invoke(&["teardown", netns], Some(Self::payload(opts)?))
            .await?;
        Ok(())
    }

    async fn network_inspect(&self, name: &str) -> Result<NetworkInfo, EngineError> {
        let stdout = self
            .invoke(&["inspect", name], None)
            .await
            .map_err(|_| EngineError::NoSuchNetwork(name.to_string()))?;
        let parsed: HelperNetwork = serde_json::from_slice(&stdout)?;
        Ok(NetworkInfo {
            name: parsed.name,
            id: parsed.id,
            driver: parsed.driver,
            dns_enabled: parsed.dns_enabled,
            gateway: parsed.gateway,
        })
    }

    async fn network_info(&self) -> Result<Vec<NetworkInfo>, EngineError> {
        let stdout = self.invoke(&["list"], None).await?;
        let parsed: Vec<HelperNetwork> = serde_json::from_slice(&stdout)?;
        Ok(parsed
            .into_iter()
            .map(|n| NetworkInfo {
                name: n.name,
                id: n.id,
                driver: n.driver,
                dns_enabled: n.dns_enabled,
                gateway: n.gateway,
            })
            .collect())
    }

    fn drivers(&self) -> Vec<String> {
        vec![
            "bridge".to_string(),
            "macvlan".to_string(),
            "ipvlan".to_string(),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_helper_is_internal_error() {
        let backend = HelperBackend::new(PathBuf::from("/nonexistent/netavark"));
        let opts = SetupOptions::default();
        assert!(matches!(
            backend.setup("/run/netns/x", &opts).await,
            Err(EngineError::Internal(_))
        ));
    }
}
