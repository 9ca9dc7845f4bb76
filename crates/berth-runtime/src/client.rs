//! Runtime client abstraction.

use std::collections::BTreeMap;

use async_trait::async_trait;
use berth_common::error::Result;
use berth_common::types::{ContainerId, ContainerName};

use crate::exec::ExecOutput;
use crate::fanout::FanOut;

/// A container known to the runtime, running or stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSummary {
    /// Runtime-assigned ID.
    pub id: ContainerId,
    /// Every name the runtime reports for the container.
    pub names: Vec<ContainerName>,
}

/// Restart policy applied by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartPolicy {
    /// Never restart.
    No,
    /// Always restart.
    Always,
    /// Restart when the process exits non-zero.
    OnFailure,
    /// Restart unless explicitly stopped.
    UnlessStopped,
}

impl RestartPolicy {
    /// Parses the configuration spelling of a restart policy.
    ///
    /// Unknown or empty values yield `None` so the runtime default applies.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "no" => Some(Self::No),
            "always" => Some(Self::Always),
            "on-failure" => Some(Self::OnFailure),
            "unless-stopped" => Some(Self::UnlessStopped),
            _ => None,
        }
    }
}

/// A host port bound to a container port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortBinding {
    /// Host side.
    pub host_port: u16,
    /// Container side, published as TCP.
    pub container_port: u16,
}

/// Everything the runtime needs to create one container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CreateContainerRequest {
    /// Container name.
    pub name: String,
    /// Image reference.
    pub image: String,
    /// Allocate a TTY.
    pub tty: bool,
    /// Working directory override.
    pub working_dir: Option<String>,
    /// Entrypoint override.
    pub entrypoint: Vec<String>,
    /// Command override.
    pub cmd: Vec<String>,
    /// Environment in `KEY=VALUE` form.
    pub env: Vec<String>,
    /// Signal used to stop the container.
    pub stop_signal: Option<String>,
    /// Bind mounts.
    pub binds: Vec<String>,
    /// Run the runtime's init as PID 1.
    pub init: bool,
    /// Run privileged.
    pub privileged: bool,
    /// Capabilities to add.
    pub cap_add: Vec<String>,
    /// IPC namespace mode.
    pub ipc_mode: Option<String>,
    /// PID namespace mode.
    pub pid_mode: Option<String>,
    /// UTS namespace mode.
    pub uts_mode: Option<String>,
    /// Network mode.
    pub network_mode: Option<String>,
    /// Security options.
    pub security_opt: Vec<String>,
    /// Tmpfs mounts.
    pub tmpfs: BTreeMap<String, String>,
    /// Published ports.
    pub ports: Vec<PortBinding>,
    /// DNS servers.
    pub dns: Vec<String>,
    /// DNS search domains.
    pub dns_search: Vec<String>,
    /// Extra `/etc/hosts` entries.
    pub extra_hosts: Vec<String>,
    /// Restart policy.
    pub restart_policy: Option<RestartPolicy>,
}

/// Result of creating a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedContainer {
    /// Runtime-assigned ID.
    pub id: ContainerId,
    /// Warnings the runtime returned alongside the ID.
    pub warnings: Vec<String>,
}

/// Options for a single image build.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildOptions {
    /// Tag applied to the result.
    pub tag: String,
    /// Dockerfile path inside the context archive.
    pub dockerfile: String,
    /// Remove intermediate containers even on failure.
    pub force_rm: bool,
    /// Squash the result into one layer.
    pub squash: bool,
    /// Build arguments.
    pub build_args: BTreeMap<String, String>,
}

/// Operations berth needs from a container engine.
#[async_trait]
pub trait RuntimeClient: Send + Sync {
    /// Lists every repo tag of every local image.
    ///
    /// # Errors
    ///
    /// Returns an error if the runtime cannot be queried.
    async fn list_image_tags(&self) -> Result<Vec<String>>;

    /// Lists all containers, including stopped ones.
    ///
    /// # Errors
    ///
    /// Returns an error if the runtime cannot be queried.
    async fn list_containers(&self) -> Result<Vec<ContainerSummary>>;

    /// Creates a container without starting it.
    ///
    /// # Errors
    ///
    /// Returns an error if the runtime rejects the request.
    async fn create_container(&self, request: &CreateContainerRequest) -> Result<CreatedContainer>;

    /// Starts a created container.
    ///
    /// # Errors
    ///
    /// Returns an error if the container cannot be started.
    async fn start_container(&self, id: &ContainerId) -> Result<()>;

    /// Reports whether a container is running.
    ///
    /// # Errors
    ///
    /// Returns an error if the container cannot be inspected.
    async fn is_running(&self, id: &ContainerId) -> Result<bool>;

    /// Runs a command inside a running container and captures its output.
    ///
    /// # Errors
    ///
    /// Returns an error if the exec cannot be created or attached.
    async fn exec(&self, id: &ContainerId, user: Option<&str>, cmd: &[String])
    -> Result<ExecOutput>;

    /// Pulls an image, streaming progress into `output`.
    ///
    /// # Errors
    ///
    /// Returns [`berth_common::error::BerthError::Pull`] on failure.
    async fn pull_image(&self, reference: &str, output: &FanOut) -> Result<()>;

    /// Builds an image from a tar context, streaming progress into `output`.
    ///
    /// # Errors
    ///
    /// Returns [`berth_common::error::BerthError::Build`] on failure.
    async fn build_image(&self, context: Vec<u8>, options: &BuildOptions, output: &FanOut)
    -> Result<()>;
}
