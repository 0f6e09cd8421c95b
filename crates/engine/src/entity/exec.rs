//! Exec session entity — a process started inside a running container.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecSession {
    pub id: String,
    pub container_id: String,

    pub command: Vec<String>,
    pub env: Vec<String>,
    pub terminal: bool,
    pub cwd: String,
    pub user: String,
    pub detach_keys: String,

    /// PID of the exec process, 0 before start.
    pub pid: i32,
    /// -1 until the process exits.
    pub exit_code: i32,
}

impl Default for ExecSession {
    fn default() -> Self {
        Self {
            id: String::new(),
            container_id: String::new(),
            command: Vec::new(),
            env: Vec::new(),
            terminal: false,
            cwd: "/".to_string(),
            user: String::new(),
            detach_keys: String::new(),
            pid: 0,
            exit_code: -1,
        }
    }
}

impl ExecSession {
    pub fn running(&self) -> bool {
        self.pid > 0 && self.exit_code < 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_running_detection() {
        let mut session = ExecSession::default();
        assert!(!session.running());
        session.pid = 123;
        assert!(session.running());
        session.exit_code = 0;
        assert!(!session.running());
    }
}
