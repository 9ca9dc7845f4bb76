//! One-shot command execution inside containers.

use berth_common::error::{BerthError, Result};
use berth_common::types::ContainerId;

use crate::client::RuntimeClient;

/// Output from an exec command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    /// Standard output from the command.
    pub stdout: String,
    /// Standard error from the command.
    pub stderr: String,
    /// Exit code returned by the command.
    pub exit_code: i64,
}

impl ExecOutput {
    /// Returns whether the command exited with status zero.
    #[must_use]
    pub const fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Runs `command` inside a container, starting the container first if it
/// is not running.
///
/// A failed start is logged and the exec is attempted anyway; the exec
/// error then describes the real problem.
///
/// # Errors
///
/// Returns an error if the command is empty, the container cannot be
/// inspected, or the exec fails.
pub async fn exec_in_container(
    runtime: &dyn RuntimeClient,
    id: &ContainerId,
    user: Option<&str>,
    command: &[String],
) -> Result<ExecOutput> {
    tracing::debug!(container = %id, user = ?user, cmd = ?command, "exec into container");

    if command.is_empty() {
        return Err(BerthError::config("exec command is empty"));
    }

    if !runtime.is_running(id).await? {
        tracing::info!(container = %id, "starting container for exec");
        if let Err(e) = runtime.start_container(id).await {
            tracing::warn!(container = %id, error = %e, "cannot start container");
        }
    }

    runtime.exec(id, user, command).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockRuntime;

    #[tokio::test]
    async fn exec_starts_stopped_container() {
        let runtime = MockRuntime::new();
        let id = runtime.add_container("core", false);
        let out = exec_in_container(&runtime, &id, Some("root"), &["true".into()])
            .await
            .expect("exec");
        assert!(out.success());
        assert!(runtime.is_running(&id).await.expect("inspect"));
        assert_eq!(runtime.exec_calls().len(), 1);
    }

    #[tokio::test]
    async fn exec_rejects_empty_command() {
        let runtime = MockRuntime::new();
        let id = runtime.add_container("core", true);
        let err = exec_in_container(&runtime, &id, None, &[]).await.unwrap_err();
        assert!(err.to_string().contains("empty"));
    }
}
