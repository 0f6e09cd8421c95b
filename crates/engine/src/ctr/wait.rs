//! Wait — block until a container exits or reaches a target condition.
//!
//! The entity lock is never held across the blocking poll: each round takes
//! the lock, resyncs, inspects, and releases before sleeping. Cancellation
//! comes from an injected token and converts to `Canceled` after the
//! current atomic step.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::entity::{ContainerStatus, HealthCheckStatus};
use crate::errors::EngineError;

use super::Container;

/// Poll cadence when the caller passes none (or a non-positive interval).
pub const DEFAULT_WAIT_INTERVAL: Duration = Duration::from_millis(250);

impl Container {
    /// Wait for the container to exit and return its exit code.
    ///
    /// A container that was never started (Configured/Created) reports exit
    /// code 0. A container that is already gone is answered from the
    /// exit-code cache; a cache miss is `CtrRemoved`.
    pub async fn wait(
        &self,
        interval: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<i32, EngineError> {
        let interval = match interval {
            Some(d) if !d.is_zero() => d,
            _ => DEFAULT_WAIT_INTERVAL,
        };

        loop {
            // Lock only for the sync + inspection, never for the sleep.
            {
                let _guard = self.hold();
                match self.sync().await {
                    Ok(()) => {}
                    Err(EngineError::CtrRemoved(_)) | Err(EngineError::NoSuchCtr(_)) => {
                        return self.cached_exit_code().await;
                    }
                    Err(e) => return Err(e),
                }

                let state = self.state();
                match state.state {
                    // Stopped without an exit file (dead monitor) reports
                    // the no-recorded-exit value rather than hanging.
                    ContainerStatus::Exited | ContainerStatus::Stopped => {
                        return Ok(state.exit_code)
                    }
                    ContainerStatus::Configured | ContainerStatus::Created => {
                        return Ok(0);
                    }
                    _ => {}
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(EngineError::Canceled),
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }

    /// Race a set of target container states (and optionally health states)
    /// through a cancellable rendezvous; returns the state that matched.
    pub async fn wait_for_condition(
        &self,
        conditions: &[ContainerStatus],
        health_conditions: &[HealthCheckStatus],
        interval: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<ContainerStatus, EngineError> {
        if conditions.is_empty() && health_conditions.is_empty() {
            return Err(EngineError::InvalidArg(
                "wait requires at least one condition".to_string(),
            ));
        }
        let interval = match interval {
            Some(d) if !d.is_zero() => d,
            _ => DEFAULT_WAIT_INTERVAL,
        };

        loop {
            {
                let _guard = self.hold();
                match self.sync().await {
                    Ok(()) => {}
                    Err(EngineError::CtrRemoved(_)) | Err(EngineError::NoSuchCtr(_)) => {
                        // Gone counts as having left every live state.
                        if conditions.iter().any(|c| {
                            matches!(c, ContainerStatus::Exited | ContainerStatus::Removing)
                        }) {
                            return Ok(ContainerStatus::Removing);
                        }
                        return Err(EngineError::CtrRemoved(self.config.id.clone()));
                    }
                    Err(e) => return Err(e),
                }
                let state = self.state();
                if conditions.contains(&state.state) {
                    return Ok(state.state);
                }
                if health_conditions.contains(&state.health_check_status) {
                    return Ok(state.state);
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(EngineError::Canceled),
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }

    async fn cached_exit_code(&self) -> Result<i32, EngineError> {
        match self.engine.store.container_exit_code(&self.config.id).await {
            Ok(code) => Ok(code),
            Err(EngineError::NoSuchExitCode(_)) => {
                Err(EngineError::CtrRemoved(self.config.id.clone()))
            }
            Err(e) => Err(e),
        }
    }
}
