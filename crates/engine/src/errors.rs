//! Error taxonomy — typed sentinels for every engine failure mode.
//!
//! Call sites match on variants to distinguish "already stopped" from real
//! failures; user-facing callers render the `Display` text. Partial-failure
//! variants carry a map from entity ID to the error that entity produced.

use std::collections::HashMap;
use std::fmt;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    // ── Lookup ────────────────────────────────────────────────
    #[error("no such container: {0}")]
    NoSuchCtr(String),
    #[error("no such pod: {0}")]
    NoSuchPod(String),
    #[error("no volume with name \"{0}\" found")]
    NoSuchVolume(String),
    #[error("no exec session with ID \"{0}\" found")]
    NoSuchExecSession(String),
    #[error("no network with name or ID \"{0}\" found")]
    NoSuchNetwork(String),
    #[error("no exit code recorded for \"{0}\"")]
    NoSuchExitCode(String),

    // ── Existence ─────────────────────────────────────────────
    #[error("container {0} already exists")]
    CtrExists(String),
    #[error("pod {0} already exists")]
    PodExists(String),
    #[error("volume {0} already exists")]
    VolumeExists(String),
    #[error("container {ctr} is already connected to network {network}")]
    NetworkConnected { ctr: String, network: String },
    #[error("network {0} already exists")]
    NetworkExists(String),

    // ── State ─────────────────────────────────────────────────
    #[error("container {id} is in state {state}: {msg}")]
    CtrStateInvalid { id: String, state: String, msg: String },
    #[error("container {0} is stopped")]
    CtrStopped(String),
    #[error("container {0} has been removed")]
    CtrRemoved(String),
    #[error("pod {0} has been removed")]
    PodRemoved(String),
    #[error("volume {0} has been removed")]
    VolumeRemoved(String),
    #[error("volume {name} is being used by container(s) {users}")]
    VolumeBeingUsed { name: String, users: String },
    #[error("container {id} has dependent containers which must be removed first: {deps}")]
    DepExists { id: String, deps: String },

    // ── Config ────────────────────────────────────────────────
    #[error("invalid argument: {0}")]
    InvalidArg(String),
    #[error("database configuration mismatch: {0}")]
    DBBadConfig(String),
    #[error("database connection is closed")]
    DBClosed,
    #[error("engine has already been shut down")]
    RuntimeStopped,
    #[error("lock ordering violation would deadlock: {0}")]
    WillDeadlock(String),

    #[error("cycle found in container dependencies: {0}")]
    PodCyclicDependency(String),

    // ── Partial failure ───────────────────────────────────────
    #[error("{}", render_partial("error starting some containers", .0))]
    PodPartialFail(HashMap<String, EngineError>),
    #[error("{}", render_partial("error removing containers", .0))]
    RemovingCtrs(HashMap<String, EngineError>),

    // ── Resource ──────────────────────────────────────────────
    #[error("allocation failed; exhausted all free locks")]
    NoFreeLocks,
    #[error("required plugin {0} is missing")]
    MissingPlugin(String),
    #[error("OCI runtime \"{0}\" is missing")]
    OCIRuntimeNotFound(String),
    #[error("container monitor for {0} has died")]
    ConmonDead(String),

    // ── Flow ──────────────────────────────────────────────────
    #[error("operation canceled")]
    Canceled,
    #[error("detached from container")]
    Detach,
    #[error("not implemented: {0}")]
    NotImplemented(String),
    #[error("internal engine error: {0}")]
    Internal(String),

    // ── Wrapped library errors ────────────────────────────────
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("state database error: {0}")]
    Kv(#[from] sled::Error),
    #[error("state database error: {0}")]
    Sql(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

fn render_partial(prefix: &str, errors: &HashMap<String, EngineError>) -> String {
    let mut parts: Vec<String> = errors
        .iter()
        .map(|(id, err)| format!("{}: {}", short_id(id), err))
        .collect();
    parts.sort();
    format!("{}: {}", prefix, parts.join("; "))
}

/// First 12 characters of an entity ID, the conventional display form.
pub fn short_id(id: &str) -> &str {
    if id.len() > 12 {
        &id[..12]
    } else {
        id
    }
}

impl EngineError {
    /// True for errors that an idempotent caller treats as success:
    /// stopping a stopped container, removing a removed one.
    pub fn is_idempotent_success(&self) -> bool {
        matches!(
            self,
            EngineError::CtrStopped(_) | EngineError::CtrRemoved(_) | EngineError::NoSuchCtr(_)
        )
    }

    /// The per-entity error map of a partial failure, if this is one.
    pub fn partial_errors(&self) -> Option<&HashMap<String, EngineError>> {
        match self {
            EngineError::PodPartialFail(m) | EngineError::RemovingCtrs(m) => Some(m),
            _ => None,
        }
    }
}

impl From<locks::LockError> for EngineError {
    fn from(e: locks::LockError) -> Self {
        match e {
            locks::LockError::NoFreeLocks => EngineError::NoFreeLocks,
            locks::LockError::NotImplemented => {
                EngineError::NotImplemented("lock backend".to_string())
            }
            other => EngineError::Internal(format!("lock manager: {}", other)),
        }
    }
}

/// Wrapper that renders an error chain for event payloads.
pub struct ErrorChain<'a>(pub &'a EngineError);

impl fmt::Display for ErrorChain<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)?;
        let mut source = std::error::Error::source(self.0);
        while let Some(err) = source {
            write!(f, ": {}", err)?;
            source = err.source();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_failure_rendering() {
        let mut errs = HashMap::new();
        errs.insert(
            "aaaaaaaaaaaaaaaa".to_string(),
            EngineError::CtrStopped("aaaaaaaaaaaaaaaa".to_string()),
        );
        errs.insert(
            "bbbbbbbbbbbbbbbb".to_string(),
            EngineError::Canceled,
        );
        let err = EngineError::PodPartialFail(errs);
        let text = err.to_string();
        assert!(text.contains("aaaaaaaaaaaa:"));
        assert!(text.contains("operation canceled"));
        assert!(err.partial_errors().is_some());
    }

    #[test]
    fn test_short_id() {
        assert_eq!(short_id("0123456789abcdef"), "0123456789ab");
        assert_eq!(short_id("abc"), "abc");
    }

    #[test]
    fn test_idempotent_classification() {
        assert!(EngineError::CtrStopped("x".into()).is_idempotent_success());
        assert!(!EngineError::Canceled.is_idempotent_success());
    }
}
