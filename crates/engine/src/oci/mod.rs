//! OCI runtime boundary — the consumed capability set of the external
//! container runtime plus its conmon-style monitor.
//!
//! The runtime is a black-box process supervisor: the engine never inspects
//! its internals, only invokes operations and reads the files the monitor
//! leaves behind (exit file, OOM file, pidfiles). Implementations are
//! selectable at runtime; an entry named by absolute path is synthesized
//! ad hoc, and a missing binary degrades to [`MissingRuntime`], whose every
//! operation fails with a typed error.

pub mod conmon;
pub mod fake;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::entity::ExecSession;
use crate::errors::EngineError;

pub use conmon::ConmonRuntime;
pub use fake::FakeRuntime;

/// Everything the runtime needs to create a container. Deliberately narrow:
/// the engine owns the full config, the runtime only sees process-level
/// knobs and paths.
#[derive(Debug, Clone)]
pub struct CtrRequest {
    pub id: String,
    /// OCI bundle directory (config.json + rootfs mount point).
    pub bundle: PathBuf,
    pub terminal: bool,
    pub open_stdin: bool,
    /// Path to a pre-created network namespace, when one exists.
    pub netns: Option<String>,
    pub cgroup_parent: String,
    pub systemd_cgroups: bool,
}

/// A created container's process identifiers.
#[derive(Debug, Clone, Copy)]
pub struct CreatedCtr {
    pub pid: i32,
    pub conmon_pid: i32,
}

/// Raw bidirectional attach connection.
pub trait AttachStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> AttachStream for T {}

#[async_trait]
pub trait OciRuntime: Send + Sync {
    fn name(&self) -> &str;
    fn path(&self) -> &Path;

    async fn create_container(&self, req: &CtrRequest) -> Result<CreatedCtr, EngineError>;
    async fn start_container(&self, id: &str) -> Result<(), EngineError>;
    async fn kill_container(&self, id: &str, signal: u32, all: bool) -> Result<(), EngineError>;

    /// Send the stop signal, wait up to `timeout` seconds, then SIGKILL.
    /// `timeout` of zero kills immediately. Returns true when the SIGKILL
    /// path was taken.
    async fn stop_container(
        &self,
        id: &str,
        stop_signal: u32,
        timeout: u32,
        all: bool,
    ) -> Result<bool, EngineError>;

    async fn delete_container(&self, id: &str) -> Result<(), EngineError>;
    async fn pause_container(&self, id: &str) -> Result<(), EngineError>;
    async fn unpause_container(&self, id: &str) -> Result<(), EngineError>;

    async fn attach(&self, id: &str) -> Result<Box<dyn AttachStream>, EngineError>;
    async fn attach_resize(&self, id: &str, width: u16, height: u16) -> Result<(), EngineError>;

    /// Start an exec session attached to piped stdio; returns its PID.
    async fn exec_container(&self, id: &str, session: &ExecSession) -> Result<i32, EngineError>;
    /// Start an exec session detached from the caller; returns its PID.
    async fn exec_container_detached(
        &self,
        id: &str,
        session: &ExecSession,
    ) -> Result<i32, EngineError>;
    async fn exec_attach_resize(
        &self,
        id: &str,
        session_id: &str,
        width: u16,
        height: u16,
    ) -> Result<(), EngineError>;
    async fn exec_stop_container(
        &self,
        id: &str,
        session_id: &str,
        timeout: u32,
    ) -> Result<(), EngineError>;
    /// Poll a session; `Some(code)` once it has exited.
    async fn exec_update_status(
        &self,
        id: &str,
        session_id: &str,
    ) -> Result<Option<i32>, EngineError>;

    async fn checkpoint_container(&self, id: &str, image_dir: &Path) -> Result<(), EngineError>;

    /// Probe the monitor process with signal 0.
    fn check_conmon_running(&self, conmon_pid: i32) -> bool;

    /// Apply resource limit updates to a running container.
    async fn update_container(
        &self,
        id: &str,
        resources: &serde_json::Value,
    ) -> Result<(), EngineError>;

    fn exit_file_path(&self, id: &str) -> PathBuf;
    fn oom_file_path(&self, id: &str) -> PathBuf;
    fn persist_dir_path(&self, id: &str) -> PathBuf;
}

/// Read and delete a monitor-written exit file. The file is a plain decimal
/// integer; its presence means "definitely exited".
pub fn consume_exit_file(path: &Path) -> Result<Option<i32>, EngineError> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let code: i32 = raw.trim().parse().map_err(|_| {
        EngineError::Internal(format!(
            "exit file {} does not contain a decimal exit code: {:?}",
            path.display(),
            raw
        ))
    })?;
    if let Err(e) = std::fs::remove_file(path) {
        tracing::warn!(path = %path.display(), error = %e, "failed to remove consumed exit file");
    }
    Ok(Some(code))
}

/// Probe an arbitrary PID with signal 0.
pub fn process_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_ok()
}

/// Proxy for a configured runtime whose binary could not be found. Carried
/// in the runtime table so lookups succeed; every operation fails.
pub struct MissingRuntime {
    name: String,
    path: PathBuf,
}

impl MissingRuntime {
    pub fn new(name: String) -> Self {
        MissingRuntime {
            path: PathBuf::from(&name),
            name,
        }
    }

    fn missing(&self) -> EngineError {
        EngineError::OCIRuntimeNotFound(self.name.clone())
    }
}

#[async_trait]
impl OciRuntime for MissingRuntime {
    fn name(&self) -> &str {
        &self.name
    }

    fn path(&self) -> &Path {
        &self.path
    }

    async fn create_container(&self, _req: &CtrRequest) -> Result<CreatedCtr, EngineError> {
        Err(self.missing())
    }

    async fn start_container(&self, _id: &str) -> Result<(), EngineError> {
        Err(self.missing())
    }

    async fn kill_container(&self, _id: &str, _signal: u32, _all: bool) -> Result<(), EngineError> {
        Err(self.missing())
    }

    async fn stop_container(
        &self,
        _id: &str,
        _stop_signal: u32,
        _timeout: u32,
        _all: bool,
    ) -> Result<bool, EngineError> {
        Err(self.missing())
    }

    async fn delete_container(&self, _id: &str) -> Result<(), EngineError> {
        Err(self.missing())
    }

    async fn pause_container(&self, _id: &str) -> Result<(), EngineError> {
        Err(self.missing())
    }

    async fn unpause_container(&self, _id: &str) -> Result<(), EngineError> {
        Err(self.missing())
    }

    async fn attach(&self, _id: &str) -> Result<Box<dyn AttachStream>, EngineError> {
        Err(self.missing())
    }

    async fn attach_resize(&self, _id: &str, _width: u16, _height: u16) -> Result<(), EngineError> {
        Err(self.missing())
    }

    async fn exec_container(&self, _id: &str, _session: &ExecSession) -> Result<i32, EngineError> {
        Err(self.missing())
    }

    async fn exec_container_detached(
        &self,
        _id: &str,
        _session: &ExecSession,
    ) -> Result<i32, EngineError> {
        Err(self.missing())
    }

    async fn exec_attach_resize(
        &self,
        _id: &str,
        _session_id: &str,
        _width: u16,
        _height: u16,
    ) -> Result<(), EngineError> {
        Err(self.missing())
    }

    async fn exec_stop_container(
        &self,
        _id: &str,
        _session_id: &str,
        _timeout: u32,
    ) -> Result<(), EngineError> {
        Err(self.missing())
    }

    async fn exec_update_status(
        &self,
        _id: &str,
        _session_id: &str,
    ) -> Result<Option<i32>, EngineError> {
        Err(self.missing())
    }

    async fn checkpoint_container(&self, _id: &str, _image_dir: &Path) -> Result<(), EngineError> {
        Err(self.missing())
    }

    fn check_conmon_running(&self, _conmon_pid: i32) -> bool {
        false
    }

    async fn update_container(
        &self,
        _id: &str,
        _resources: &serde_json::Value,
    ) -> Result<(), EngineError> {
        Err(self.missing())
    }

    fn exit_file_path(&self, id: &str) -> PathBuf {
        PathBuf::from("/nonexistent/exits").join(id)
    }

    fn oom_file_path(&self, id: &str) -> PathBuf {
        PathBuf::from("/nonexistent/oom").join(id)
    }

    fn persist_dir_path(&self, id: &str) -> PathBuf {
        PathBuf::from("/nonexistent/persist").join(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_consume_exit_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("exit");

        assert_eq!(consume_exit_file(&path).unwrap(), None);

        std::fs::write(&path, "137\n").unwrap();
        assert_eq!(consume_exit_file(&path).unwrap(), Some(137));
        // Consumed: the file is gone.
        assert!(!path.exists());
        assert_eq!(consume_exit_file(&path).unwrap(), None);
    }

    #[test]
    fn test_garbage_exit_file_rejected() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("exit");
        std::fs::write(&path, "not a number").unwrap();
        assert!(consume_exit_file(&path).is_err());
    }

    #[tokio::test]
    async fn test_missing_runtime_fails_typed() {
        let runtime = MissingRuntime::new("kata".to_string());
        match runtime.start_container("abc").await {
            Err(EngineError::OCIRuntimeNotFound(name)) => assert_eq!(name, "kata"),
            other => panic!("unexpected: {:?}", other),
        }
        assert!(!runtime.check_conmon_running(1));
    }

    #[test]
    fn test_process_alive_self() {
        assert!(process_alive(std::process::id() as i32));
        assert!(!process_alive(0));
        assert!(!process_alive(-1));
    }
}
