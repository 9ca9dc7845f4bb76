//! Container setup: find or create a named container once its image is
//! ready.

use std::sync::Arc;

use async_trait::async_trait;
use berth_common::config::ContainerSpec;
use berth_common::constants::INIT_BIND_MOUNT;
use berth_common::error::{BerthError, JobResult, Result, SharedError};
use berth_common::types::{ContainerId, ContainerName};
use berth_runtime::RuntimeClient;
use berth_runtime::client::{CreateContainerRequest, PortBinding, RestartPolicy};

use crate::job::{Completion, Observer, SetupJob};
use crate::waiter::ImageWaiter;

const HOST_MODE: &str = "host";

fn host_mode(shared: bool) -> Option<String> {
    shared.then(|| HOST_MODE.to_string())
}

/// Translates a container declaration into a runtime create request.
#[must_use]
pub fn create_request(name: &str, spec: &ContainerSpec) -> CreateContainerRequest {
    let mut binds = spec.mounts.clone();
    if !spec.disable_init {
        binds.push(INIT_BIND_MOUNT.to_string());
    }
    let restart_policy = spec.restart_policy.as_deref().and_then(|policy| {
        let parsed = RestartPolicy::parse(policy);
        if parsed.is_none() {
            tracing::warn!(container = %name, policy, "ignoring unknown restart policy");
        }
        parsed
    });

    CreateContainerRequest {
        name: name.to_string(),
        image: spec.image.clone(),
        tty: spec.tty,
        working_dir: spec.working_directory.clone(),
        entrypoint: spec.entrypoint.clone(),
        cmd: spec.cmd.clone(),
        env: spec.env.clone(),
        stop_signal: spec.stop_signal.clone(),
        binds,
        init: !spec.disable_init,
        privileged: spec.privileged,
        cap_add: spec.cap_add.clone(),
        ipc_mode: host_mode(spec.host_ipc),
        pid_mode: host_mode(spec.host_pid),
        uts_mode: host_mode(spec.host_uts),
        network_mode: host_mode(spec.host_network),
        security_opt: spec.security_opt.clone(),
        tmpfs: spec.tmp_fs.clone(),
        ports: spec
            .ports
            .iter()
            .map(|p| PortBinding {
                host_port: p.host_port,
                container_port: p.container_port,
            })
            .collect(),
        dns: spec.dns.clone(),
        dns_search: spec.dns_search.clone(),
        extra_hosts: spec.hosts.clone(),
        restart_policy,
    }
}

/// Provisions one container.
pub struct ContainerSetup {
    name: String,
    spec: ContainerSpec,
    runtime: Arc<dyn RuntimeClient>,
    images: Arc<dyn ImageWaiter>,
    done: Completion<ContainerId>,
}

impl std::fmt::Debug for ContainerSetup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerSetup")
            .field("name", &self.name)
            .field("image", &self.spec.image)
            .finish_non_exhaustive()
    }
}

impl ContainerSetup {
    /// Creates the job for container `name`.
    pub fn new(
        name: impl Into<String>,
        spec: ContainerSpec,
        runtime: Arc<dyn RuntimeClient>,
        images: Arc<dyn ImageWaiter>,
    ) -> Self {
        Self {
            name: name.into(),
            spec,
            runtime,
            images,
            done: Completion::new(),
        }
    }

    /// Returns the image this container runs.
    #[must_use]
    pub fn image(&self) -> &str {
        &self.spec.image
    }

    async fn find_existing(&self) -> Result<Option<ContainerId>> {
        let wanted = ContainerName::new(&self.name);
        let containers = self.runtime.list_containers().await?;
        Ok(containers
            .into_iter()
            .find(|c| c.names.contains(&wanted))
            .map(|c| c.id))
    }

    async fn converge(&self) -> JobResult<ContainerId> {
        if self.spec.image.is_empty() {
            return Err(Arc::new(BerthError::config(format!(
                "container {} does not name an image",
                self.name
            ))));
        }
        if let Some(id) = self.find_existing().await.map_err(Arc::new)? {
            tracing::debug!(container = %self.name, id = %id, "container exists");
            return Ok(id);
        }

        tracing::info!(container = %self.name, image = %self.spec.image, "waiting for image");
        self.images.wait_for_image(&self.spec.image, None).await?;
        if let Some(id) = self.find_existing().await.map_err(Arc::new)? {
            return Ok(id);
        }
        self.create().await.map_err(Arc::new)
    }

    async fn create(&self) -> Result<ContainerId> {
        let request = create_request(&self.name, &self.spec);
        let created = self.runtime.create_container(&request).await?;
        for warning in &created.warnings {
            tracing::warn!(container = %self.name, warning = %warning, "runtime warning");
        }
        tracing::info!(container = %self.name, id = %created.id, "container created");

        if self.spec.start_after_create {
            if let Err(e) = self.runtime.start_container(&created.id).await {
                tracing::warn!(container = %self.name, error = %e, "cannot start container");
            }
        }
        Ok(created.id)
    }

    /// Waits for the job and returns the container ID.
    ///
    /// While the container still waits on its image, `observer` receives
    /// the image's progress output.
    ///
    /// # Errors
    ///
    /// Returns the error the job failed with.
    pub async fn wait_id(&self, observer: Option<Observer>) -> JobResult<ContainerId> {
        if let Some(observer) = observer {
            if !self.done.is_finished() {
                tokio::select! {
                    outcome = self.done.wait() => return outcome,
                    _ = self.images.wait_for_image(&self.spec.image, Some(observer)) => {}
                }
            }
        }
        self.done.wait().await
    }
}

#[async_trait]
impl SetupJob for ContainerSetup {
    fn kind(&self) -> &'static str {
        "container"
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self) -> JobResult<()> {
        let outcome = self.converge().await;
        let _ = self.done.finish(outcome.clone());
        outcome.map(|_| ())
    }

    async fn wait(&self, observer: Option<Observer>) -> JobResult<()> {
        self.wait_id(observer).await.map(|_| ())
    }

    fn abandon(&self, error: SharedError) {
        let _ = self.done.finish(Err(error));
    }
}
