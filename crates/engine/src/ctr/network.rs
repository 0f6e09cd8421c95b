//! Container network lifecycle — connect and disconnect while respecting
//! container state.

use std::collections::HashMap;

use crate::entity::PerNetworkOptions;
use crate::errors::EngineError;
use crate::events::{EventKind, EventStatus};
use crate::net::{self, SetupOptions};

use super::Container;
use crate::entity::ContainerStatus;

impl Container {
    fn connect_allowed(&self) -> Result<(), EngineError> {
        if self.config.network_mode != "bridge" {
            return Err(EngineError::InvalidArg(format!(
                "network connect requires bridge networking, container uses {}",
                self.config.network_mode
            )));
        }
        Ok(())
    }

    /// Is the container in a state where network changes act on a live
    /// namespace?
    fn net_live(&self) -> bool {
        matches!(
            self.status(),
            ContainerStatus::Running | ContainerStatus::Created
        )
    }

    pub async fn network_connect(
        &self,
        name_or_id: &str,
        mut opts: PerNetworkOptions,
    ) -> Result<(), EngineError> {
        self.check_lock_order()?;
        let _guard = self.hold();
        if !self.is_batched() {
            self.sync().await?;
        }
        self.connect_allowed()?;

        let network = net::normalize_name(self.engine.network.as_ref(), name_or_id).await?;
        let existing = self.engine.store.container_networks(&self.config.id).await?;
        if existing.contains_key(&network) {
            if self.net_live() {
                return Err(EngineError::NetworkConnected {
                    ctr: self.config.id.clone(),
                    network,
                });
            }
            // Docker-compat: a redundant attach on a container that is not
            // up is a no-op.
            tracing::debug!(
                ctr = self.config.id.as_str(),
                network = network.as_str(),
                "container already connected, redundant attach ignored"
            );
            return Ok(());
        }

        let driver = self
            .engine
            .network
            .network_inspect(&network)
            .await
            .map(|info| info.driver)
            .unwrap_or_default();
        opts.interface_name = net::assign_interface_name(
            &existing,
            &opts.interface_name,
            self.engine.config.interface_naming_by_driver,
            &driver,
        );

        self.engine
            .store
            .network_connect(&self.config.id, &network, &opts)
            .await?;

        if self.net_live() {
            let netns = self.state.lock().net_ns.clone();
            let mut networks = HashMap::new();
            networks.insert(network.clone(), opts.clone());
            let setup = SetupOptions {
                container_id: self.config.id.clone(),
                container_name: self.config.name.clone(),
                port_mappings: self.config.port_mappings.clone(),
                networks,
            };
            let status = self.engine.network.setup(&netns, &setup).await?;
            let was_first = {
                let mut state = self.state.lock();
                let was_first = state.network_status.is_empty();
                for (net_name, net_status) in &status {
                    state.network_status.insert(net_name.clone(), net_status.clone());
                }
                was_first
            };
            if self.engine.config.rootless() && was_first {
                self.engine.reload_rootless_port_forwarder(&self.config.id);
            }
            for (net_name, net_status) in &status {
                self.add_network_file_entries(net_name, net_status, &opts.aliases)?;
            }
            self.save().await?;
        }

        self.engine
            .event(
                EventKind::Network,
                EventStatus::Connect,
                &self.config.id,
                &network,
            )
            .await;
        Ok(())
    }

    pub async fn network_disconnect(&self, name_or_id: &str, force: bool) -> Result<(), EngineError> {
        self.check_lock_order()?;
        let _guard = self.hold();
        if !self.is_batched() {
            self.sync().await?;
        }
        self.connect_allowed()?;

        let network = net::normalize_name(self.engine.network.as_ref(), name_or_id)
            .await
            .or_else(|e| {
                // A force disconnect may target a network that no longer
                // exists in the backend; fall back to the stored name.
                if force {
                    Ok(name_or_id.to_string())
                } else {
                    Err(e)
                }
            })?;

        let existing = self.engine.store.container_networks(&self.config.id).await?;
        if !existing.contains_key(&network) {
            return Err(EngineError::NoSuchNetwork(format!(
                "container {} is not connected to network {}",
                self.config.id, network
            )));
        }

        if self.net_live() {
            let netns = self.state.lock().net_ns.clone();
            let mut networks = HashMap::new();
            networks.insert(
                network.clone(),
                existing.get(&network).cloned().unwrap_or_default(),
            );
            let teardown = SetupOptions {
                container_id: self.config.id.clone(),
                container_name: self.config.name.clone(),
                port_mappings: self.config.port_mappings.clone(),
                networks,
            };
            if let Err(e) = self.engine.network.teardown(&netns, &teardown).await {
                if force {
                    tracing::warn!(network = network.as_str(), error = %e, "force disconnect: teardown failed");
                } else {
                    return Err(e);
                }
            }

            let (status, now_empty) = {
                let mut state = self.state.lock();
                let status = state.network_status.remove(&network);
                (status, state.network_status.is_empty())
            };
            self.remove_network_file_entries(&network, status.as_ref())?;
            if self.engine.config.rootless() && now_empty {
                self.engine.reload_rootless_port_forwarder(&self.config.id);
            }
            self.save().await?;
        }

        self.engine
            .store
            .network_disconnect(&self.config.id, &network)
            .await?;
        self.engine
            .event(
                EventKind::Network,
                EventStatus::Disconnect,
                &self.config.id,
                &network,
            )
            .await;
        Ok(())
    }
}
