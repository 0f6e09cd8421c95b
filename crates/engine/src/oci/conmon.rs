//! Conmon-backed runtime — drives an OCI runtime binary through a
//! conmon-compatible monitor process.
//!
//! The monitor owns the container's stdio, double-forks away from the
//! engine, and writes the exit file when the container dies. The engine
//! talks to the runtime binary directly for everything that does not need
//! stdio ownership (start, kill, pause, delete, state).

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;

use crate::entity::ExecSession;
use crate::errors::EngineError;

use super::{process_alive, AttachStream, CreatedCtr, CtrRequest, OciRuntime};

use async_trait::async_trait;

/// How long to wait for conmon to write the pidfiles after spawning.
const PIDFILE_WAIT: Duration = Duration::from_secs(10);
const PIDFILE_POLL: Duration = Duration::from_millis(25);

pub struct ConmonRuntime {
    name: String,
    /// OCI runtime binary (crun, runc, or an ad-hoc absolute path).
    runtime_path: PathBuf,
    conmon_path: PathBuf,
    /// Runtime state root, passed as `--root`.
    run_root: PathBuf,
    /// Exit files, OOM files, pidfiles, attach sockets live under here.
    tmp_dir: PathBuf,
}

impl ConmonRuntime {
    pub fn new(
        name: String,
        runtime_path: PathBuf,
        conmon_path: PathBuf,
        run_root: PathBuf,
        tmp_dir: PathBuf,
    ) -> Result<Self, EngineError> {
        for sub in ["exits", "oom", "persist", "sockets", "pids"] {
            std::fs::create_dir_all(tmp_dir.join(sub))?;
        }
        Ok(ConmonRuntime {
            name,
            runtime_path,
            conmon_path,
            run_root,
            tmp_dir,
        })
    }

    fn pidfile(&self, id: &str) -> PathBuf {
        self.tmp_dir.join("pids").join(format!("{}.pid", id))
    }

    fn conmon_pidfile(&self, id: &str) -> PathBuf {
        self.tmp_dir.join("pids").join(format!("{}.conmon.pid", id))
    }

    fn socket_dir(&self) -> PathBuf {
        self.tmp_dir.join("sockets")
    }

    /// Run the OCI runtime binary with `--root` and the given args.
    async fn runtime_cmd(&self, args: &[&str]) -> Result<std::process::Output, EngineError> {
        tracing::debug!(runtime = %self.runtime_path.display(), ?args, "invoking OCI runtime");
        let output = Command::new(&self.runtime_path)
            .arg("--root")
            .arg(&self.run_root)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await?;
        if !output.status.success() {
            return Err(EngineError::Internal(format!(
                "{} {} failed: {}",
                self.name,
                args.first().unwrap_or(&""),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(output)
    }

    /// Query the runtime for a container's status string.
    async fn runtime_state(&self, id: &str) -> Result<String, EngineError> {
        let output = self.runtime_cmd(&["state", id]).await?;
        let parsed: serde_json::Value = serde_json::from_slice(&output.stdout)?;
        Ok(parsed
            .get("status")
            .and_then(|s| s.as_str())
            .unwrap_or("unknown")
            .to_string())
    }

    async fn read_pidfile(&self, path: &Path) -> Result<i32, EngineError> {
        let deadline = tokio::time::Instant::now() + PIDFILE_WAIT;
        loop {
            match tokio::fs::read_to_string(path).await {
                Ok(raw) => {
                    if let Ok(pid) = raw.trim().parse() {
                        return Ok(pid);
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(EngineError::ConmonDead(format!(
                    "monitor never wrote pidfile {}",
                    path.display()
                )));
            }
            tokio::time::sleep(PIDFILE_POLL).await;
        }
    }
}

#[async_trait]
impl OciRuntime for ConmonRuntime {
    fn name(&self) -> &str {
        &self.name
    }

    fn path(&self) -> &Path {
        &self.runtime_path
    }

    async fn create_container(&self, req: &CtrRequest) -> Result<CreatedCtr, EngineError> {
        let pidfile = self.pidfile(&req.id);
        let conmon_pidfile = self.conmon_pidfile(&req.id);
        // Stale pidfiles from a previous boot must not satisfy the wait.
        let _ = std::fs::remove_file(&pidfile);
        let _ = std::fs::remove_file(&conmon_pidfile);

        let mut cmd = Command::new(&self.conmon_path);
        cmd.arg("--api-version").arg("1");
        cmd.arg("-c").arg(&req.id);
        cmd.arg("-u").arg(&req.id);
        cmd.arg("-r").arg(&self.runtime_path);
        cmd.arg("-b").arg(&req.bundle);
        cmd.arg("-p").arg(&pidfile);
        cmd.arg("--conmon-pidfile").arg(&conmon_pidfile);
        cmd.arg("--exit-dir").arg(self.tmp_dir.join("exits"));
        cmd.arg("--oom-score-dir").arg(self.tmp_dir.join("oom"));
        cmd.arg("--persist-dir").arg(self.persist_dir_path(&req.id));
        cmd.arg("--socket-dir-path").arg(self.socket_dir());
        cmd.arg("--runtime-arg").arg("--root");
        cmd.arg("--runtime-arg").arg(&self.run_root);
        cmd.arg("-l")
            .arg(format!("none:{}", req.bundle.join("ctr.log").display()));
        if req.terminal {
            cmd.arg("-t");
        }
        if req.open_stdin {
            cmd.arg("-i");
        }
        if req.systemd_cgroups {
            cmd.arg("-s");
        }
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::null());
        cmd.stderr(Stdio::piped());

        tracing::debug!(ctr = req.id.as_str(), conmon = %self.conmon_path.display(), "spawning container monitor");
        let child = cmd.spawn()?;
        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(EngineError::Internal(format!(
                "conmon failed to create container {}: {}",
                req.id,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        // Conmon double-forks; the PIDs come from the files it leaves.
        let pid = self.read_pidfile(&pidfile).await?;
        let conmon_pid = self.read_pidfile(&conmon_pidfile).await?;
        Ok(CreatedCtr { pid, conmon_pid })
    }

    async fn start_container(&self, id: &str) -> Result<(), EngineError> {
        self.runtime_cmd(&["start", id]).await?;
        Ok(())
    }

    async fn kill_container(&self, id: &str, signal: u32, all: bool) -> Result<(), EngineError> {
        let sig = signal.to_string();
        let mut args = vec!["kill"];
        if all {
            args.push("--all");
        }
        args.push(id);
        args.push(&sig);
        self.runtime_cmd(&args).await?;
        Ok(())
    }

    async fn stop_container(
        &self,
        id: &str,
        stop_signal: u32,
        timeout: u32,
        all: bool,
    ) -> Result<bool, EngineError> {
        if timeout > 0 {
            self.kill_container(id, stop_signal, all).await?;
            let deadline =
                tokio::time::Instant::now() + Duration::from_secs(u64::from(timeout));
            while tokio::time::Instant::now() < deadline {
                match self.runtime_state(id).await {
                    Ok(status) if status == "stopped" => return Ok(false),
                    // State queries can race the runtime removing its
                    // bookkeeping; treat as stopped.
                    Err(_) => return Ok(false),
                    Ok(_) => {}
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            tracing::warn!(
                ctr = id,
                timeout,
                "container did not stop after signal {}, sending SIGKILL",
                stop_signal
            );
        }
        self.kill_container(id, libc::SIGKILL as u32, all).await?;
        Ok(true)
    }

    async fn delete_container(&self, id: &str) -> Result<(), EngineError> {
        self.runtime_cmd(&["delete", "--force", id]).await?;
        Ok(())
    }

    async fn pause_container(&self, id: &str) -> Result<(), EngineError> {
        self.runtime_cmd(&["pause", id]).await?;
        Ok(())
    }

    async fn unpause_container(&self, id: &str) -> Result<(), EngineError> {
        self.runtime_cmd(&["resume", id]).await?;
        Ok(())
    }

    async fn attach(&self, id: &str) -> Result<Box<dyn AttachStream>, EngineError> {
        let socket = self.socket_dir().join(id).join("attach");
        let stream = tokio::net::UnixStream::connect(&socket).await.map_err(|e| {
            EngineError::ConmonDead(format!(
                "cannot connect to attach socket {}: {}",
                socket.display(),
                e
            ))
        })?;
        Ok(Box::new(stream))
    }

    async fn attach_resize(&self, id: &str, width: u16, height: u16) -> Result<(), EngineError> {
        // Window size changes go through conmon's control FIFO: "1 <h> <w>".
        let ctl = self.socket_dir().join(id).join("ctl");
        tokio::fs::write(&ctl, format!("1 {} {}\n", height, width))
            .await
            .map_err(|e| {
                EngineError::ConmonDead(format!(
                    "cannot write control FIFO {}: {}",
                    ctl.display(),
                    e
                ))
            })
    }

    async fn exec_container(&self, id: &str, session: &ExecSession) -> Result<i32, EngineError> {
        let pid_path = self
            .tmp_dir
            .join("pids")
            .join(format!("{}.exec.pid", session.id));
        let _ = std::fs::remove_file(&pid_path);

        let mut cmd = Command::new(&self.runtime_path);
        cmd.arg("--root").arg(&self.run_root);
        cmd.arg("exec");
        cmd.arg("--pid-file").arg(&pid_path);
        if session.terminal {
            cmd.arg("--tty");
        }
        if !session.cwd.is_empty() {
            cmd.arg("--cwd").arg(&session.cwd);
        }
        if !session.user.is_empty() {
            cmd.arg("--user").arg(&session.user);
        }
        for env in &session.env {
            cmd.arg("--env").arg(env);
        }
        cmd.arg(id);
        cmd.args(&session.command);
        cmd.stdin(Stdio::inherit());
        cmd.stdout(Stdio::inherit());
        cmd.stderr(Stdio::inherit());

        let mut child = cmd.spawn()?;
        let pid = self.read_pidfile(&pid_path).await?;
        // The runtime binary stays in the foreground of the exec; reap it
        // in the background so the session outlives this call.
        tokio::spawn(async move {
            let _ = child.wait().await;
        });
        Ok(pid)
    }

    async fn exec_container_detached(
        &self,
        id: &str,
        session: &ExecSession,
    ) -> Result<i32, EngineError> {
        let pid_path = self
            .tmp_dir
            .join("pids")
            .join(format!("{}.exec.pid", session.id));
        let _ = std::fs::remove_file(&pid_path);

        let mut cmd = Command::new(&self.runtime_path);
        cmd.arg("--root").arg(&self.run_root);
        cmd.arg("exec").arg("--detach");
        cmd.arg("--pid-file").arg(&pid_path);
        if !session.cwd.is_empty() {
            cmd.arg("--cwd").arg(&session.cwd);
        }
        if !session.user.is_empty() {
            cmd.arg("--user").arg(&session.user);
        }
        for env in &session.env {
            cmd.arg("--env").arg(env);
        }
        cmd.arg(id);
        cmd.args(&session.command);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::null());
        cmd.stderr(Stdio::piped());

        let output = cmd.output().await?;
        if !output.status.success() {
            return Err(EngineError::Internal(format!(
                "exec in container {} failed: {}",
                id,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        self.read_pidfile(&pid_path).await
    }

    async fn exec_attach_resize(
        &self,
        _id: &str,
        _session_id: &str,
        _width: u16,
        _height: u16,
    ) -> Result<(), EngineError> {
        Err(EngineError::NotImplemented(
            "exec terminal resize without an attach socket".to_string(),
        ))
    }

    async fn exec_stop_container(
        &self,
        _id: &str,
        session_id: &str,
        timeout: u32,
    ) -> Result<(), EngineError> {
        // An existing exit file means the session is already gone; leave it
        // for exec_update_status to consume.
        if self.tmp_dir.join("exits").join(session_id).exists() {
            return Ok(());
        }
        let pid_path = self
            .tmp_dir
            .join("pids")
            .join(format!("{}.exec.pid", session_id));
        let pid = match tokio::fs::read_to_string(&pid_path).await {
            Ok(raw) => raw.trim().parse::<i32>().unwrap_or(0),
            Err(_) => return Ok(()),
        };
        if pid <= 0 {
            return Ok(());
        }

        let target = nix::unistd::Pid::from_raw(pid);
        let _ = nix::sys::signal::kill(target, nix::sys::signal::Signal::SIGTERM);
        let deadline = tokio::time::Instant::now() + Duration::from_secs(u64::from(timeout));
        while process_alive(pid) {
            if tokio::time::Instant::now() >= deadline {
                let _ = nix::sys::signal::kill(target, nix::sys::signal::Signal::SIGKILL);
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        Ok(())
    }

    async fn exec_update_status(
        &self,
        _id: &str,
        session_id: &str,
    ) -> Result<Option<i32>, EngineError> {
        // The exec monitor writes an exit file named after the session.
        let exit_file = self.tmp_dir.join("exits").join(session_id);
        super::consume_exit_file(&exit_file)
    }

    async fn checkpoint_container(&self, id: &str, image_dir: &Path) -> Result<(), EngineError> {
        let image = image_dir.to_string_lossy().into_owned();
        self.runtime_cmd(&["checkpoint", "--image-path", &image, id])
            .await?;
        Ok(())
    }

    fn check_conmon_running(&self, conmon_pid: i32) -> bool {
        process_alive(conmon_pid)
    }

    async fn update_container(
        &self,
        id: &str,
        resources: &serde_json::Value,
    ) -> Result<(), EngineError> {
        let path = self.tmp_dir.join(format!("{}.resources.json", id));
        tokio::fs::write(&path, serde_json::to_vec(resources)?).await?;
        let path_str = path.to_string_lossy().into_owned();
        let result = self.runtime_cmd(&["update", "-r", &path_str, id]).await;
        let _ = std::fs::remove_file(&path);
        result.map(|_| ())
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
    async fn test_paths_are_per_container() {
        let dir = tempfile::TempDir::new().unwrap();
        let runtime = ConmonRuntime::new(
            "crun".to_string(),
            PathBuf::from("/usr/bin/crun"),
            PathBuf::from("/usr/bin/conmon"),
            dir.path().join("run"),
            dir.path().join("tmp"),
        )
        .unwrap();

        assert_eq!(
            runtime.exit_file_path("abc"),
            dir.path().join("tmp/exits/abc")
        );
        assert_ne!(runtime.exit_file_path("abc"), runtime.exit_file_path("def"));
        assert!(dir.path().join("tmp/exits").is_dir());
        assert_eq!(runtime.name(), "crun");
    }
}
