//! Interfaces through which dependent jobs observe their dependencies.

use async_trait::async_trait;
use berth_common::error::{JobResult, Result};
use berth_common::types::ContainerId;
use berth_runtime::exec::ExecOutput;

use crate::job::Observer;

/// Lets container jobs block on image jobs.
#[async_trait]
pub trait ImageWaiter: Send + Sync {
    /// Waits for the image job named `name`, feeding its progress to
    /// `observer` meanwhile.
    ///
    /// # Errors
    ///
    /// Returns the job's error, or a not-found error for an unknown name.
    async fn wait_for_image(&self, name: &str, observer: Option<Observer>) -> JobResult<()>;
}

/// Lets user jobs query and block on container jobs.
#[async_trait]
pub trait ContainerWaiter: Send + Sync {
    /// Returns whether a container job named `name` exists. Never blocks.
    fn check_has_container(&self, name: &str) -> bool;

    /// Waits for the container job named `name` and returns the container
    /// ID it resolved.
    ///
    /// # Errors
    ///
    /// Returns the job's error, or a not-found error for an unknown name.
    async fn wait_for_container(
        &self,
        name: &str,
        observer: Option<Observer>,
    ) -> JobResult<ContainerId>;

    /// Runs a one-shot command in a container, starting it if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the container cannot be inspected or the exec
    /// fails.
    async fn exec_cmd_container(
        &self,
        id: &ContainerId,
        user: Option<&str>,
        command: &[String],
    ) -> Result<ExecOutput>;
}
