//! Fake — test double for the OCI runtime.
//!
//! Provides a deterministic [`FakeRuntime`] that implements [`OciRuntime`]
//! using in-memory state, writing real exit files into a directory so the
//! engine's exit-file handling is exercised without a container runtime.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI32, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::entity::ExecSession;
use crate::errors::EngineError;

use super::{AttachStream, CreatedCtr, CtrRequest, OciRuntime};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FakeStatus {
    Created,
    Running,
    Paused,
    Stopped,
}

#[derive(Debug, Clone)]
struct FakeCtr {
    status: FakeStatus,
    pid: i32,
    conmon_pid: i32,
}

/// Mutable inner state protected by a mutex.
#[derive(Default)]
struct Inner {
    containers: HashMap<String, FakeCtr>,
    /// Chronological log of operations, for assertions.
    calls: Vec<String>,
    /// Exit code the next kill/stop records, keyed by container.
    exit_codes: HashMap<String, i32>,
}

/// A fake OCI runtime for deterministic testing. All methods operate on
/// in-memory state; exit files are written to `<tmp_dir>/exits` exactly like
/// a real monitor would.
pub struct FakeRuntime {
    tmp_dir: PathBuf,
    inner: Mutex<Inner>,
    next_pid: AtomicI32,
    path: PathBuf,
}

impl FakeRuntime {
    pub fn new(tmp_dir: PathBuf) -> Self {
        std::fs::create_dir_all(tmp_dir.join("exits")).ok();
        std::fs::create_dir_all(tmp_dir.join("oom")).ok();
        std::fs::create_dir_all(tmp_dir.join("persist")).ok();
        FakeRuntime {
            tmp_dir,
            inner: Mutex::new(Inner::default()),
            next_pid: AtomicI32::new(1000),
            path: PathBuf::from("/usr/bin/fake-runtime"),
        }
    }

    /// Pre-set the exit code the container reports when it dies.
    pub fn set_exit_code(&self, id: &str, code: i32) {
        self.inner.lock().exit_codes.insert(id.to_string(), code);
    }

    /// Simulate the container exiting on its own with `code`: the monitor
    /// writes the exit file and the process disappears.
    pub fn exit_container(&self, id: &str, code: i32) {
        let mut inner = self.inner.lock();
        if let Some(ctr) = inner.containers.get_mut(id) {
            ctr.status = FakeStatus::Stopped;
        }
        std::fs::write(self.tmp_dir.join("exits").join(id), code.to_string()).ok();
    }

    pub fn calls(&self) -> Vec<String> {
        self.inner.lock().calls.clone()
    }

    pub fn status(&self, id: &str) -> Option<FakeStatus> {
        self.inner.lock().containers.get(id).map(|c| c.status)
    }

    fn record(&self, call: String) {
        self.inner.lock().calls.push(call);
    }

    fn write_exit_file(&self, inner: &Inner, id: &str, default_code: i32) {
        let code = inner.exit_codes.get(id).copied().unwrap_or(default_code);
        std::fs::write(self.tmp_dir.join("exits").join(id), code.to_string()).ok();
    }
}

#[async_trait]
impl OciRuntime for FakeRuntime {
    fn name(&self) -> &str {
        "fake"
    }

    fn path(&self) -> &Path {
        &self.path
    }

    async fn create_container(&self, req: &CtrRequest) -> Result<CreatedCtr, EngineError> {
        self.record(format!("create {}", req.id));
        let pid = self.next_pid.fetch_add(2, Ordering::SeqCst);
        let conmon_pid = pid + 1;
        self.inner.lock().containers.insert(
            req.id.clone(),
            FakeCtr {
                status: FakeStatus::Created,
                pid,
                conmon_pid,
            },
        );
        Ok(CreatedCtr { pid, conmon_pid })
    }

    async fn start_container(&self, id: &str) -> Result<(), EngineError> {
        self.record(format!("start {}", id));
        let mut inner = self.inner.lock();
        let ctr = inner
            .containers
            .get_mut(id)
            .ok_or_else(|| EngineError::NoSuchCtr(id.to_string()))?;
        ctr.status = FakeStatus::Running;
        Ok(())
    }

    async fn kill_container(&self, id: &str, signal: u32, _all: bool) -> Result<(), EngineError> {
        self.record(format!("kill {} {}", id, signal));
        let mut inner = self.inner.lock();
        let ctr = inner
            .containers
            .get_mut(id)
            .ok_or_else(|| EngineError::NoSuchCtr(id.to_string()))?;
        if signal == libc::SIGKILL as u32 || signal == libc::SIGTERM as u32 {
            ctr.status = FakeStatus::Stopped;
            let default_code = 128 + signal as i32;
            self.write_exit_file(&inner, id, default_code);
        }
        Ok(())
    }

    async fn stop_container(
        &self,
        id: &str,
        stop_signal: u32,
        timeout: u32,
        all: bool,
    ) -> Result<bool, EngineError> {
        self.record(format!("stop {} sig={} t={}", id, stop_signal, timeout));
        if timeout == 0 {
            self.kill_container(id, libc::SIGKILL as u32, all).await?;
            return Ok(true);
        }
        // The fake container always honors its stop signal; graceful exits
        // report 0 unless a code was pre-set.
        let mut inner = self.inner.lock();
        let ctr = inner
            .containers
            .get_mut(id)
            .ok_or_else(|| EngineError::NoSuchCtr(id.to_string()))?;
        ctr.status = FakeStatus::Stopped;
        self.write_exit_file(&inner, id, 0);
        Ok(false)
    }

    async fn delete_container(&self, id: &str) -> Result<(), EngineError> {
        self.record(format!("delete {}", id));
        self.inner.lock().containers.remove(id);
        Ok(())
    }

    async fn pause_container(&self, id: &str) -> Result<(), EngineError> {
        self.record(format!("pause {}", id));
        let mut inner = self.inner.lock();
        let ctr = inner
            .containers
            .get_mut(id)
            .ok_or_else(|| EngineError::NoSuchCtr(id.to_string()))?;
        ctr.status = FakeStatus::Paused;
        Ok(())
    }

    async fn unpause_container(&self, id: &str) -> Result<(), EngineError> {
        self.record(format!("unpause {}", id));
        let mut inner = self.inner.lock();
        let ctr = inner
            .containers
            .get_mut(id)
            .ok_or_else(|| EngineError::NoSuchCtr(id.to_string()))?;
        ctr.status = FakeStatus::Running;
        Ok(())
    }

    async fn attach(&self, id: &str) -> Result<Box<dyn AttachStream>, EngineError> {
        self.record(format!("attach {}", id));
        let (ours, theirs) = tokio::io::duplex(4096);
        // The far end is dropped immediately; attach tests only need a live
        // stream object.
        drop(theirs);
        Ok(Box::new(ours))
    }

    async fn attach_resize(&self, id: &str, width: u16, height: u16) -> Result<(), EngineError> {
        self.record(format!("resize {} {}x{}", id, width, height));
        Ok(())
    }

    async fn exec_container(&self, id: &str, session: &ExecSession) -> Result<i32, EngineError> {
        self.record(format!("exec {} {}", id, session.id));
        Ok(self.next_pid.fetch_add(1, Ordering::SeqCst))
    }

    async fn exec_container_detached(
        &self,
        id: &str,
        session: &ExecSession,
    ) -> Result<i32, EngineError> {
        self.record(format!("exec-detached {} {}", id, session.id));
        Ok(self.next_pid.fetch_add(1, Ordering::SeqCst))
    }

    async fn exec_attach_resize(
        &self,
        _id: &str,
        _session_id: &str,
        _width: u16,
        _height: u16,
    ) -> Result<(), EngineError> {
        Ok(())
    }

    async fn exec_stop_container(
        &self,
        id: &str,
        session_id: &str,
        _timeout: u32,
    ) -> Result<(), EngineError> {
        self.record(format!("exec-stop {} {}", id, session_id));
        std::fs::write(self.tmp_dir.join("exits").join(session_id), "137").ok();
        Ok(())
    }

    async fn exec_update_status(
        &self,
        _id: &str,
        session_id: &str,
    ) -> Result<Option<i32>, EngineError> {
        super::consume_exit_file(&self.tmp_dir.join("exits").join(session_id))
    }

    async fn checkpoint_container(&self, id: &str, _image_dir: &Path) -> Result<(), EngineError> {
        self.record(format!("checkpoint {}", id));
        Ok(())
    }

    fn check_conmon_running(&self, conmon_pid: i32) -> bool {
        let inner = self.inner.lock();
        inner
            .containers
            .values()
            .any(|c| c.conmon_pid == conmon_pid && c.status != FakeStatus::Stopped)
    }

    async fn update_container(
        &self,
        id: &str,
        _resources: &serde_json::Value,
    ) -> Result<(), EngineError> {
        self.record(format!("update {}", id));
        Ok(())
    }

    fn exit_file_path(&self, id: &str) -> PathBuf {
        self.tmp_dir.join("exits").join(id)
    }

    fn oom_file_path(&self, id: &str) -> PathBuf {
        self.tmp_dir.join("oom").join(id)
    }

    fn persist_dir_path(&self, id: &str) -> PathBuf {
        self.tmp_dir.join("persist").join(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_lifecycle_and_exit_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let runtime = FakeRuntime::new(dir.path().to_path_buf());

        let req = CtrRequest {
            id: "c1".to_string(),
            bundle: dir.path().join("bundle"),
            terminal: false,
            open_stdin: false,
            netns: None,
            cgroup_parent: String::new(),
            systemd_cgroups: false,
        };
        let created = runtime.create_container(&req).await.unwrap();
        assert!(created.pid > 0);
        assert!(runtime.check_conmon_running(created.conmon_pid));

        runtime.start_container("c1").await.unwrap();
        assert_eq!(runtime.status("c1"), Some(FakeStatus::Running));

        runtime.set_exit_code("c1", 7);
        runtime
            .kill_container("c1", libc::SIGKILL as u32, false)
            .await
            .unwrap();
        assert_eq!(
            super::super::consume_exit_file(&runtime.exit_file_path("c1")).unwrap(),
            Some(7)
        );
        assert!(!runtime.check_conmon_running(created.conmon_pid));
    }

    #[tokio::test]
    async fn test_stop_zero_timeout_is_sigkill() {
        let dir = tempfile::TempDir::new().unwrap();
        let runtime = FakeRuntime::new(dir.path().to_path_buf());
        let req = CtrRequest {
            id: "c2".to_string(),
            bundle: dir.path().join("bundle"),
            terminal: false,
            open_stdin: false,
            netns: None,
            cgroup_parent: String::new(),
            systemd_cgroups: false,
        };
        runtime.create_container(&req).await.unwrap();
        runtime.start_container("c2").await.unwrap();

        let killed = runtime.stop_container("c2", 15, 0, false).await.unwrap();
        assert!(killed);
        assert!(runtime
            .calls()
            .iter()
            .any(|c| c.contains(&format!("kill c2 {}", libc::SIGKILL))));
    }
}
