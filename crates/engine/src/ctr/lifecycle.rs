//! Container lifecycle — init, start, stop, kill, pause, cleanup.
//!
//! Transition rules:
//!   init  : Configured | Stopped | Exited
//!   start : Configured | Created | Stopped | Exited (init runs first)
//!   stop  : Running | Stopping
//!   pause : Running; unpause: Paused
//! Partial failure after the rootfs is mounted tears down storage, network,
//! and reserved host ports before surfacing the error.

use std::net::TcpListener;
use std::path::{Path, PathBuf};

use chrono::Utc;
use once_cell::sync::Lazy;

use crate::entity::{ContainerStatus, NetworkStatus};
use crate::errors::EngineError;
use crate::events::EventStatus;
use crate::net::hosts::{self, HostEntry};
use crate::net::SetupOptions;
use crate::oci::CtrRequest;

use super::Container;

static CGROUPS_V2: Lazy<bool> =
    Lazy::new(|| Path::new("/sys/fs/cgroup/cgroup.controllers").exists());

pub(crate) fn cgroups_v2() -> bool {
    *CGROUPS_V2
}

impl Container {
    fn state_invalid(&self, status: ContainerStatus, msg: &str) -> EngineError {
        EngineError::CtrStateInvalid {
            id: self.config.id.clone(),
            state: status.to_string(),
            msg: msg.to_string(),
        }
    }

    /// OCI bundle directory for this container.
    pub(crate) fn bundle_dir(&self) -> PathBuf {
        self.engine.config.run_root.join("ctrs").join(&self.config.id)
    }

    // ── Init ──────────────────────────────────────────────────

    pub async fn init(&self) -> Result<(), EngineError> {
        self.check_lock_order()?;
        let _guard = self.hold();
        if !self.is_batched() {
            self.sync().await?;
        }
        self.do_init().await
    }

    pub(crate) async fn do_init(&self) -> Result<(), EngineError> {
        let status = self.status();
        if !status.can_init() {
            return Err(self.state_invalid(status, "cannot be initialized"));
        }

        // All dependencies must already be running.
        for dep in &self.config.dependencies {
            let dep_state = self.engine.store.container_state(dep).await?;
            if dep_state.state != ContainerStatus::Running {
                return Err(EngineError::CtrStateInvalid {
                    id: dep.clone(),
                    state: dep_state.state.to_string(),
                    msg: format!("dependency of container {} is not running", self.config.id),
                });
            }
        }

        let mountpoint = self.mount_storage()?;
        {
            let mut state = self.state.lock();
            state.mountpoint = mountpoint;
            state.mounted = true;
        }
        self.mount_named_volumes().await?;

        // Past this point every failure must release storage, network, and
        // reserved host ports before surfacing.
        if let Err(err) = self.prepare_after_mount().await {
            if let Err(e) = self.teardown_network().await {
                tracing::error!(ctr = self.config.id.as_str(), error = %e, "network teardown after failed init");
            }
            self.engine.free_ports(&self.config.id);
            if let Err(e) = self.unmount_storage().await {
                tracing::error!(ctr = self.config.id.as_str(), error = %e, "storage teardown after failed init");
            }
            {
                let mut state = self.state.lock();
                state.error = err.to_string();
            }
            if let Err(e) = self.save().await {
                tracing::error!(ctr = self.config.id.as_str(), error = %e, "saving error state after failed init");
            }
            return Err(err);
        }

        self.save().await?;
        self.emit(EventStatus::Init).await;
        Ok(())
    }

    async fn prepare_after_mount(&self) -> Result<(), EngineError> {
        self.reserve_ports()?;
        let status_map = self.setup_network().await?;
        self.write_network_files(&status_map)?;

        let req = CtrRequest {
            id: self.config.id.clone(),
            bundle: self.bundle_dir(),
            terminal: self.config.terminal,
            open_stdin: self.config.open_stdin,
            netns: {
                let ns = self.state.lock().net_ns.clone();
                if ns.is_empty() {
                    None
                } else {
                    Some(ns)
                }
            },
            cgroup_parent: self.config.cgroup_parent.clone(),
            systemd_cgroups: matches!(
                self.config.cgroup_manager,
                crate::entity::CgroupManager::Systemd
            ),
        };
        let created = self.oci().create_container(&req).await?;

        let mut state = self.state.lock();
        state.pid = created.pid;
        state.conmon_pid = created.conmon_pid;
        state.state = ContainerStatus::Created;
        state.error.clear();
        state.exited = false;
        state.exit_code = -1;
        state.oom_killed = false;
        state.stopped_by_user = false;
        Ok(())
    }

    // ── Start ─────────────────────────────────────────────────

    pub async fn start(&self) -> Result<(), EngineError> {
        self.check_lock_order()?;
        let _guard = self.hold();
        if !self.is_batched() {
            self.sync().await?;
        }

        let status = self.status();
        if status == ContainerStatus::Running {
            return Err(self.state_invalid(status, "container is already running"));
        }
        if !status.can_start() {
            return Err(self.state_invalid(status, "cannot be started"));
        }
        let was_exited = status == ContainerStatus::Exited;
        if status != ContainerStatus::Created {
            self.do_init().await?;
        }

        self.oci().start_container(&self.config.id).await?;
        {
            let mut state = self.state.lock();
            state.state = ContainerStatus::Running;
            state.started_time = Some(Utc::now());
            state.finished_time = None;
            if was_exited {
                state.restart_count += 1;
            }
        }
        self.save().await?;
        self.emit(EventStatus::Start).await;
        Ok(())
    }

    // ── Stop / Kill ───────────────────────────────────────────

    pub async fn stop(&self, timeout: Option<u32>) -> Result<(), EngineError> {
        self.check_lock_order()?;
        let _guard = self.hold();
        if !self.is_batched() {
            self.sync().await?;
        }

        let status = self.status();
        match status {
            ContainerStatus::Running | ContainerStatus::Stopping => {}
            ContainerStatus::Stopped | ContainerStatus::Exited => {
                return Err(EngineError::CtrStopped(self.config.id.clone()))
            }
            other => return Err(self.state_invalid(other, "only running containers can be stopped")),
        }

        let timeout = timeout.unwrap_or(self.config.stop_timeout);
        {
            let mut state = self.state.lock();
            state.state = ContainerStatus::Stopping;
        }
        self.save().await?;

        let killed = self
            .oci()
            .stop_container(&self.config.id, self.config.stop_signal, timeout, true)
            .await?;
        {
            let mut state = self.state.lock();
            state.state = ContainerStatus::Stopped;
            state.stopped_by_user = true;
            state.finished_time = Some(Utc::now());
        }
        self.save().await?;
        if killed {
            tracing::debug!(
                ctr = self.config.id.as_str(),
                "container required SIGKILL to stop"
            );
        }

        // Pick up the exit file the monitor wrote.
        if !self.is_batched() {
            self.sync().await?;
        }
        self.emit(EventStatus::Stop).await;
        Ok(())
    }

    pub async fn kill(&self, signal: u32) -> Result<(), EngineError> {
        self.check_lock_order()?;
        let _guard = self.hold();
        if !self.is_batched() {
            self.sync().await?;
        }

        let status = self.status();
        if !status.can_stop() {
            return Err(self.state_invalid(status, "can only kill running containers"));
        }
        self.oci()
            .kill_container(&self.config.id, signal, false)
            .await?;
        {
            let mut state = self.state.lock();
            state.stopped_by_user = true;
        }
        self.save().await?;
        self.emit(EventStatus::Kill).await;
        Ok(())
    }

    pub async fn restart(&self, timeout: Option<u32>) -> Result<(), EngineError> {
        match self.stop(timeout).await {
            Ok(()) => {}
            Err(e) if e.is_idempotent_success() => {}
            Err(e) => return Err(e),
        }
        self.start().await?;
        self.emit(EventStatus::Restart).await;
        Ok(())
    }

    // ── Pause / Unpause ───────────────────────────────────────

    pub async fn pause(&self) -> Result<(), EngineError> {
        self.check_lock_order()?;
        let _guard = self.hold();
        if !self.is_batched() {
            self.sync().await?;
        }

        let status = self.status();
        if status != ContainerStatus::Running {
            return Err(self.state_invalid(status, "only running containers can be paused"));
        }
        if self.engine.config.rootless() && !cgroups_v2() {
            return Err(EngineError::InvalidArg(
                "pause requires cgroup v2 when running rootless".to_string(),
            ));
        }

        self.oci().pause_container(&self.config.id).await?;
        {
            let mut state = self.state.lock();
            state.state = ContainerStatus::Paused;
        }
        self.save().await?;
        self.emit(EventStatus::Pause).await;
        Ok(())
    }

    pub async fn unpause(&self) -> Result<(), EngineError> {
        self.check_lock_order()?;
        let _guard = self.hold();
        if !self.is_batched() {
            self.sync().await?;
        }

        let status = self.status();
        if status != ContainerStatus::Paused {
            return Err(self.state_invalid(status, "only paused containers can be unpaused"));
        }
        self.oci().unpause_container(&self.config.id).await?;
        {
            let mut state = self.state.lock();
            state.state = ContainerStatus::Running;
        }
        self.save().await?;
        self.emit(EventStatus::Unpause).await;
        Ok(())
    }

    /// Apply resource-limit updates to a live container and persist the new
    /// resources through the rewrite path.
    pub async fn update(&self, resources: &serde_json::Value) -> Result<(), EngineError> {
        self.check_lock_order()?;
        let _guard = self.hold();
        if !self.is_batched() {
            self.sync().await?;
        }

        let status = self.status();
        if !matches!(
            status,
            ContainerStatus::Running | ContainerStatus::Created | ContainerStatus::Paused
        ) {
            return Err(self.state_invalid(status, "cannot update resources"));
        }
        self.oci()
            .update_container(&self.config.id, resources)
            .await?;
        self.emit(EventStatus::Update).await;
        Ok(())
    }

    // ── Attach ────────────────────────────────────────────────

    /// Open a raw bidirectional stream to the container's stdio, owned by
    /// the monitor. Framing and detach handling live in `stream`.
    pub async fn attach(&self) -> Result<Box<dyn crate::oci::AttachStream>, EngineError> {
        self.check_lock_order()?;
        let _guard = self.hold();
        if !self.is_batched() {
            self.sync().await?;
        }
        let status = self.status();
        if !matches!(
            status,
            ContainerStatus::Running | ContainerStatus::Created
        ) {
            return Err(self.state_invalid(status, "can only attach to created or running containers"));
        }
        self.oci().attach(&self.config.id).await
    }

    pub async fn attach_resize(&self, width: u16, height: u16) -> Result<(), EngineError> {
        self.oci()
            .attach_resize(&self.config.id, width, height)
            .await
    }

    // ── Cleanup ───────────────────────────────────────────────

    /// Release per-run resources: network namespace, rootfs mount, reserved
    /// host ports, runtime bookkeeping. Idempotent; every step is attempted
    /// even when an earlier one fails, and the first error is surfaced.
    ///
    /// If the container no longer exists in the database, leftover runtime
    /// state is still deleted and the call succeeds.
    pub async fn cleanup(&self) -> Result<(), EngineError> {
        let _guard = self.hold();
        match self.sync().await {
            Err(EngineError::CtrRemoved(_)) => {
                if let Err(e) = self.oci().delete_container(&self.config.id).await {
                    tracing::debug!(ctr = self.config.id.as_str(), error = %e, "runtime delete for already-removed container");
                }
                return Ok(());
            }
            Err(e) => return Err(e),
            Ok(()) => {}
        }

        let mut first_err: Option<EngineError> = None;
        let mut keep = |step: &str, result: Result<(), EngineError>| {
            if let Err(e) = result {
                tracing::error!(step, error = %e, "container cleanup step failed");
                if first_err.is_none() {
                    first_err = Some(e);
                }
            }
        };

        keep("network", self.teardown_network().await);
        self.engine.free_ports(&self.config.id);
        keep("volumes", self.unmount_named_volumes().await);
        keep("storage", self.unmount_storage().await);

        let status = self.status();
        if matches!(
            status,
            ContainerStatus::Created | ContainerStatus::Stopped | ContainerStatus::Exited
        ) {
            if let Err(e) = self.oci().delete_container(&self.config.id).await {
                tracing::debug!(ctr = self.config.id.as_str(), error = %e, "runtime delete during cleanup");
            }
        }

        keep("save", self.save().await);
        self.emit(EventStatus::Cleanup).await;
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    // ── Storage ───────────────────────────────────────────────

    /// Mount the container rootfs. A direct-path rootfs is used as-is; an
    /// image-backed rootfs gets a per-container directory under the graph
    /// root, populated by the storage backend.
    pub(crate) fn mount_storage(&self) -> Result<String, EngineError> {
        let mountpoint = match &self.config.rootfs {
            Some(path) => path.clone(),
            None => self
                .engine
                .config
                .graph_root
                .join("overlay-containers")
                .join(&self.config.id)
                .join("merged"),
        };
        std::fs::create_dir_all(&mountpoint)?;
        std::fs::create_dir_all(self.bundle_dir())?;
        Ok(mountpoint.to_string_lossy().into_owned())
    }

    pub(crate) async fn unmount_storage(&self) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        if !state.mounted {
            return Ok(());
        }
        state.mounted = false;
        state.mountpoint = String::new();
        Ok(())
    }

    async fn mount_named_volumes(&self) -> Result<(), EngineError> {
        for named in &self.config.named_volumes {
            let volume = self.engine.volume(&named.name).await?;
            volume.mount().await?;
        }
        Ok(())
    }

    pub(crate) async fn unmount_named_volumes(&self) -> Result<(), EngineError> {
        let mut first_err = None;
        for named in &self.config.named_volumes {
            let volume = match self.engine.volume(&named.name).await {
                Ok(v) => v,
                // The volume may already be gone; not an error here.
                Err(EngineError::NoSuchVolume(_)) => continue,
                Err(e) => return Err(e),
            };
            if let Err(e) = volume.unmount().await {
                tracing::error!(volume = named.name.as_str(), error = %e, "volume unmount failed");
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    // ── Ports and network ─────────────────────────────────────

    /// Bind every published host port and park the sockets with the engine;
    /// they are handed to the supervisor and released on cleanup.
    pub(crate) fn reserve_ports(&self) -> Result<(), EngineError> {
        let mut reserved = Vec::new();
        for mapping in &self.config.port_mappings {
            if mapping.host_port == 0 {
                continue;
            }
            let host_ip = if mapping.host_ip.is_empty() {
                "0.0.0.0"
            } else {
                &mapping.host_ip
            };
            for offset in 0..mapping.range.max(1) {
                let addr = format!("{}:{}", host_ip, mapping.host_port + offset);
                match TcpListener::bind(&addr) {
                    Ok(listener) => reserved.push(listener),
                    Err(e) => {
                        // Listeners bound so far drop here, releasing them.
                        return Err(EngineError::Internal(format!(
                            "cannot reserve host port {}: {}",
                            addr, e
                        )));
                    }
                }
            }
        }
        if !reserved.is_empty() {
            self.engine
                .port_reservations
                .insert(self.config.id.clone(), reserved);
        }
        Ok(())
    }

    pub(crate) async fn setup_network(
        &self,
    ) -> Result<std::collections::HashMap<String, NetworkStatus>, EngineError> {
        let networks = self.engine.store.container_networks(&self.config.id).await?;
        if networks.is_empty() || self.config.network_mode != "bridge" {
            return Ok(Default::default());
        }
        let netns = self
            .engine
            .config
            .run_root
            .join("netns")
            .join(&self.config.id);
        std::fs::create_dir_all(netns.parent().unwrap_or(Path::new("/")))?;
        let netns = netns.to_string_lossy().into_owned();

        let opts = SetupOptions {
            container_id: self.config.id.clone(),
            container_name: self.config.name.clone(),
            port_mappings: self.config.port_mappings.clone(),
            networks,
        };
        let status = self.engine.network.setup(&netns, &opts).await?;
        {
            let mut state = self.state.lock();
            state.net_ns = netns;
            state.network_status = status.clone();
        }
        Ok(status)
    }

    pub(crate) async fn teardown_network(&self) -> Result<(), EngineError> {
        let (netns, networks) = {
            let state = self.state.lock();
            (state.net_ns.clone(), state.network_status.clone())
        };
        if netns.is_empty() {
            return Ok(());
        }
        let opts = SetupOptions {
            container_id: self.config.id.clone(),
            container_name: self.config.name.clone(),
            port_mappings: self.config.port_mappings.clone(),
            networks: networks
                .keys()
                .map(|name| (name.clone(), Default::default()))
                .collect(),
        };
        self.engine.network.teardown(&netns, &opts).await?;
        let mut state = self.state.lock();
        state.net_ns = String::new();
        state.network_status.clear();
        Ok(())
    }

    /// Seed `/etc/hosts` and `/etc/resolv.conf` for the container and
    /// register them in the bind-mount set.
    pub(crate) fn write_network_files(
        &self,
        status: &std::collections::HashMap<String, NetworkStatus>,
    ) -> Result<(), EngineError> {
        let bundle = self.bundle_dir();
        std::fs::create_dir_all(&bundle)?;
        let hosts_path = bundle.join("hosts");
        let resolv_path = bundle.join("resolv.conf");

        hosts::add_entries(
            &hosts_path,
            "default",
            &[HostEntry {
                address: "127.0.0.1".to_string(),
                names: vec!["localhost".to_string()],
            }],
        )?;
        for (network, net_status) in status {
            let aliases = self
                .config
                .networks
                .get(network)
                .map(|opts| opts.aliases.clone())
                .unwrap_or_default();
            self.add_network_file_entries(network, net_status, &aliases)?;
        }

        let mut state = self.state.lock();
        state
            .bind_mounts
            .insert("/etc/hosts".to_string(), hosts_path.to_string_lossy().into_owned());
        state.bind_mounts.insert(
            "/etc/resolv.conf".to_string(),
            resolv_path.to_string_lossy().into_owned(),
        );
        Ok(())
    }

    /// Merge one network's entries into the container's hosts/resolv files.
    pub(crate) fn add_network_file_entries(
        &self,
        network: &str,
        status: &NetworkStatus,
        aliases: &[String],
    ) -> Result<(), EngineError> {
        let bundle = self.bundle_dir();
        std::fs::create_dir_all(&bundle)?;
        if let Some(address) = status.addresses.first() {
            let bare = address
                .split('/')
                .next()
                .unwrap_or(address.as_str())
                .to_string();
            let mut names = vec![self.config.name.clone()];
            names.extend(aliases.iter().cloned());
            hosts::add_entries(
                &bundle.join("hosts"),
                network,
                &[HostEntry {
                    address: bare,
                    names,
                }],
            )?;
        }
        if !status.dns_servers.is_empty() {
            hosts::add_nameservers(&bundle.join("resolv.conf"), &status.dns_servers)?;
        }
        Ok(())
    }

    /// Drop one network's entries from the container's hosts/resolv files.
    pub(crate) fn remove_network_file_entries(
        &self,
        network: &str,
        status: Option<&NetworkStatus>,
    ) -> Result<(), EngineError> {
        let bundle = self.bundle_dir();
        hosts::remove_entries(&bundle.join("hosts"), network)?;
        if let Some(status) = status {
            if !status.dns_servers.is_empty() {
                hosts::remove_nameservers(&bundle.join("resolv.conf"), &status.dns_servers)?;
            }
        }
        Ok(())
    }
}
