//! Network backend boundary — the consumed capability set of the network
//! stack, plus a deterministic fake for tests.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::entity::{NetworkStatus, PerNetworkOptions, PortMapping};
use crate::errors::EngineError;

#[derive(Debug, Clone)]
pub struct NetworkInfo {
    pub name: String,
    pub id: String,
    pub driver: String,
    pub dns_enabled: bool,
    /// Gateway/DNS address handed to containers on this network.
    pub gateway: Option<String>,
}

/// Options for one setup/teardown invocation. Carries every network being
/// acted on; single-network operations pass a map of one.
#[derive(Debug, Clone, Default)]
pub struct SetupOptions {
    pub container_id: String,
    pub container_name: String,
    pub port_mappings: Vec<PortMapping>,
    pub networks: HashMap<String, PerNetworkOptions>,
}

#[async_trait]
pub trait NetworkBackend: Send + Sync {
    /// Attach the namespace to every network in `opts`; returns per-network
    /// status.
    async fn setup(
        &self,
        netns: &str,
        opts: &SetupOptions,
    ) -> Result<HashMap<String, NetworkStatus>, EngineError>;

    /// Detach the namespace from every network in `opts`.
    async fn teardown(&self, netns: &str, opts: &SetupOptions) -> Result<(), EngineError>;

    async fn network_inspect(&self, name: &str) -> Result<NetworkInfo, EngineError>;
    async fn network_info(&self) -> Result<Vec<NetworkInfo>, EngineError>;
    fn drivers(&self) -> Vec<String>;
}

/// In-memory network backend for tests: tracks which namespaces are
/// attached to which networks and fabricates addresses.
pub struct FakeNetwork {
    networks: Mutex<HashMap<String, NetworkInfo>>,
    /// (netns, network) pairs currently set up.
    attachments: Mutex<Vec<(String, String)>>,
}

impl FakeNetwork {
    pub fn new() -> Self {
        let fake = FakeNetwork {
            networks: Mutex::new(HashMap::new()),
            attachments: Mutex::new(Vec::new()),
        };
        fake.add_network("bridge", "0000aaaabbbbcccc", "bridge");
        fake
    }

    pub fn add_network(&self, name: &str, id: &str, driver: &str) {
        self.networks.lock().insert(
            name.to_string(),
            NetworkInfo {
                name: name.to_string(),
                id: id.to_string(),
                driver: driver.to_string(),
                dns_enabled: true,
                gateway: Some("10.88.0.1".to_string()),
            },
        );
    }

    pub fn attachments(&self) -> Vec<(String, String)> {
        self.attachments.lock().clone()
    }
}

impl Default for FakeNetwork {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NetworkBackend for FakeNetwork {
    async fn setup(
        &self,
        netns: &str,
        opts: &SetupOptions,
    ) -> Result<HashMap<String, NetworkStatus>, EngineError> {
        let networks = self.networks.lock();
        let mut status = HashMap::new();
        for (name, per_net) in &opts.networks {
            let info = networks
                .get(name)
                .ok_or_else(|| EngineError::NoSuchNetwork(name.clone()))?;
            self.attachments
                .lock()
                .push((netns.to_string(), name.clone()));
            status.insert(
                name.clone(),
                NetworkStatus {
                    interface: per_net.interface_name.clone(),
                    addresses: vec![format!("10.88.{}.10/24", opts.networks.len())],
                    gateway: info.gateway.clone(),
                    dns_servers: if info.dns_enabled {
                        info.gateway.iter().cloned().collect()
                    } else {
                        Vec::new()
                    },
                },
            );
        }
        Ok(status)
    }

    async fn teardown(&self, netns: &str, opts: &SetupOptions) -> Result<(), EngineError> {
        let mut attachments = self.attachments.lock();
        for name in opts.networks.keys() {
            attachments.retain(|(ns, net)| !(ns == netns && net == name));
        }
        Ok(())
    }

    async fn network_inspect(&self, name: &str) -> Result<NetworkInfo, EngineError> {
        self.networks
            .lock()
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::NoSuchNetwork(name.to_string()))
    }

    async fn network_info(&self) -> Result<Vec<NetworkInfo>, EngineError> {
        Ok(self.networks.lock().values().cloned().collect())
    }

    fn drivers(&self) -> Vec<String> {
        vec!["bridge".to_string(), "macvlan".to_string()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_setup_teardown_tracks_attachments() {
        let backend = FakeNetwork::new();
        let mut opts = SetupOptions {
            container_id: "c1".to_string(),
            ..Default::default()
        };
        opts.networks.insert(
            "bridge".to_string(),
            PerNetworkOptions {
                interface_name: "eth0".to_string(),
                ..Default::default()
            },
        );

        let status = backend.setup("/run/netns/c1", &opts).await.unwrap();
        assert_eq!(status["bridge"].interface, "eth0");
        assert!(!status["bridge"].addresses.is_empty());
        assert_eq!(backend.attachments().len(), 1);

        backend.teardown("/run/netns/c1", &opts).await.unwrap();
        assert!(backend.attachments().is_empty());
    }

    #[tokio::test]
    async fn test_setup_unknown_network_fails() {
        let backend = FakeNetwork::new();
        let mut opts = SetupOptions::default();
        opts.networks
            .insert("ghost".to_string(), PerNetworkOptions::default());
        assert!(matches!(
            backend.setup("/run/netns/x", &opts).await,
            Err(EngineError::NoSuchNetwork(_))
        ));
    }
}
