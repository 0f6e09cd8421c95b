//! Exec sessions — processes started inside a running container.

use crate::entity::{ContainerStatus, ExecSession};
use crate::errors::EngineError;
use crate::events::EventStatus;
use crate::util::new_id;

use super::Container;

impl Container {
    /// Register a new exec session. Returns the session ID; the process is
    /// not started yet.
    pub async fn exec_create(&self, mut session: ExecSession) -> Result<String, EngineError> {
        self.check_lock_order()?;
        let _guard = self.hold();
        if !self.is_batched() {
            self.sync().await?;
        }
        if session.command.is_empty() {
            return Err(EngineError::InvalidArg(
                "exec requires a command".to_string(),
            ));
        }

        session.id = new_id();
        session.container_id = self.config.id.clone();
        session.pid = 0;
        session.exit_code = -1;
        self.engine.store.add_exec_session(&session).await?;
        Ok(session.id)
    }

    /// Start a registered session detached from the caller's stdio.
    pub async fn exec_start_detached(&self, session_id: &str) -> Result<i32, EngineError> {
        self.check_lock_order()?;
        let _guard = self.hold();
        if !self.is_batched() {
            self.sync().await?;
        }

        let status = self.status();
        if status != ContainerStatus::Running {
            return Err(EngineError::CtrStateInvalid {
                id: self.config.id.clone(),
                state: status.to_string(),
                msg: "exec requires a running container".to_string(),
            });
        }

        let mut session = self.engine.store.exec_session(session_id).await?;
        if session.container_id != self.config.id {
            return Err(EngineError::NoSuchExecSession(session_id.to_string()));
        }
        if session.running() {
            return Err(EngineError::Internal(format!(
                "exec session {} is already running",
                session_id
            )));
        }

        let pid = self
            .oci()
            .exec_container_detached(&self.config.id, &session)
            .await?;
        session.pid = pid;
        self.engine.store.save_exec_session(&session).await?;
        {
            let mut state = self.state.lock();
            state.exec_sessions.insert(session.id.clone(), pid);
        }
        self.save().await?;
        self.emit(EventStatus::Exec).await;
        Ok(pid)
    }

    /// Poll the runtime for a session's exit; persists the exit code once
    /// observed. Returns the exit code when the session has finished.
    pub async fn exec_update_status(&self, session_id: &str) -> Result<Option<i32>, EngineError> {
        self.check_lock_order()?;
        let _guard = self.hold();
        if !self.is_batched() {
            self.sync().await?;
        }

        let mut session = self.engine.store.exec_session(session_id).await?;
        if session.exit_code >= 0 {
            return Ok(Some(session.exit_code));
        }
        match self
            .oci()
            .exec_update_status(&self.config.id, session_id)
            .await?
        {
            Some(code) => {
                session.exit_code = code;
                self.engine.store.save_exec_session(&session).await?;
                {
                    let mut state = self.state.lock();
                    state.exec_sessions.remove(session_id);
                }
                self.save().await?;
                self.emit(EventStatus::ExecDied).await;
                Ok(Some(code))
            }
            None => Ok(None),
        }
    }

    /// Stop a running session: stop signal, then SIGKILL after `timeout`.
    pub async fn exec_stop(&self, session_id: &str, timeout: u32) -> Result<(), EngineError> {
        self.check_lock_order()?;
        let _guard = self.hold();
        if !self.is_batched() {
            self.sync().await?;
        }

        let session = self.engine.store.exec_session(session_id).await?;
        if !session.running() {
            return Ok(());
        }
        self.oci()
            .exec_stop_container(&self.config.id, session_id, timeout)
            .await?;
        {
            let mut state = self.state.lock();
            state.exec_sessions.remove(session_id);
        }
        self.save().await
    }

    /// Remove a session. A running session is refused unless `force`, which
    /// stops it first.
    pub async fn exec_remove(&self, session_id: &str, force: bool) -> Result<(), EngineError> {
        self.check_lock_order()?;
        let _guard = self.hold();
        if !self.is_batched() {
            self.sync().await?;
        }

        let mut session = self.engine.store.exec_session(session_id).await?;
        if session.running() {
            // The process may have died without an observer; refresh first.
            if let Some(code) = self
                .oci()
                .exec_update_status(&self.config.id, session_id)
                .await?
            {
                session.exit_code = code;
                self.engine.store.save_exec_session(&session).await?;
            } else if force {
                self.oci()
                    .exec_stop_container(&self.config.id, session_id, 0)
                    .await?;
            } else {
                return Err(EngineError::CtrStateInvalid {
                    id: self.config.id.clone(),
                    state: "running".to_string(),
                    msg: format!("exec session {} is still running", session_id),
                });
            }
        }

        self.engine.store.remove_exec_session(session_id).await?;
        {
            let mut state = self.state.lock();
            state.exec_sessions.remove(session_id);
        }
        self.save().await
    }

    /// Remove every session, used by container removal. Dead sessions are
    /// pruned quietly; live ones are stopped when `force` is set.
    pub(crate) async fn exec_remove_all(&self, force: bool) -> Result<(), EngineError> {
        let sessions = self
            .engine
            .store
            .container_exec_sessions(&self.config.id)
            .await?;
        for session_id in sessions {
            if let Err(e) = self.exec_remove(&session_id, force).await {
                if force {
                    tracing::warn!(
                        session = session_id.as_str(),
                        error = %e,
                        "failed to remove exec session during container removal"
                    );
                    // Fall back to dropping the record so removal proceeds.
                    let _ = self.engine.store.remove_exec_session(&session_id).await;
                } else {
                    return Err(e);
                }
            }
        }
        Ok(())
    }
}
