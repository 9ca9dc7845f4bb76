//! Docker Engine implementation of [`RuntimeClient`] over `bollard`.

use std::collections::HashMap;

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions, LogOutput,
    StartContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::{BuildImageOptions, CreateImageOptions, ListImagesOptions};
use bollard::models::{self, HostConfig, RestartPolicyNameEnum};
use bytes::Bytes;
use futures::StreamExt;

use berth_common::error::{BerthError, Result};
use berth_common::types::{ContainerId, ContainerName};

use crate::client::{
    BuildOptions, ContainerSummary, CreateContainerRequest, CreatedContainer, RestartPolicy,
    RuntimeClient,
};
use crate::exec::ExecOutput;
use crate::fanout::FanOut;

/// Client for a Docker-compatible daemon.
#[derive(Debug, Clone)]
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connects using `DOCKER_HOST` or the platform's default socket.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection settings are invalid.
    pub fn connect() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults().map_err(BerthError::runtime)?;
        tracing::debug!("connected to container runtime");
        Ok(Self { docker })
    }

    /// Wraps an existing `bollard` client.
    #[must_use]
    pub const fn with_client(docker: Docker) -> Self {
        Self { docker }
    }
}

const fn restart_policy_name(policy: RestartPolicy) -> RestartPolicyNameEnum {
    match policy {
        RestartPolicy::No => RestartPolicyNameEnum::NO,
        RestartPolicy::Always => RestartPolicyNameEnum::ALWAYS,
        RestartPolicy::OnFailure => RestartPolicyNameEnum::ON_FAILURE,
        RestartPolicy::UnlessStopped => RestartPolicyNameEnum::UNLESS_STOPPED,
    }
}

fn non_empty<T>(items: &[T]) -> Option<Vec<T>>
where
    T: Clone,
{
    (!items.is_empty()).then(|| items.to_vec())
}

fn container_config(request: &CreateContainerRequest) -> Config<String> {
    let mut exposed_ports = HashMap::new();
    let mut port_bindings = HashMap::new();
    for port in &request.ports {
        let key = format!("{}/tcp", port.container_port);
        let _ = exposed_ports.insert(key.clone(), HashMap::new());
        let _ = port_bindings.insert(
            key,
            Some(vec![models::PortBinding {
                host_ip: None,
                host_port: Some(port.host_port.to_string()),
            }]),
        );
    }

    let host_config = HostConfig {
        binds: non_empty(&request.binds),
        init: request.init.then_some(true),
        privileged: Some(request.privileged),
        cap_add: non_empty(&request.cap_add),
        ipc_mode: request.ipc_mode.clone(),
        pid_mode: request.pid_mode.clone(),
        uts_mode: request.uts_mode.clone(),
        network_mode: request.network_mode.clone(),
        security_opt: non_empty(&request.security_opt),
        tmpfs: (!request.tmpfs.is_empty())
            .then(|| request.tmpfs.clone().into_iter().collect::<HashMap<_, _>>()),
        port_bindings: (!port_bindings.is_empty()).then_some(port_bindings),
        dns: non_empty(&request.dns),
        dns_search: non_empty(&request.dns_search),
        extra_hosts: non_empty(&request.extra_hosts),
        restart_policy: request.restart_policy.map(|p| models::RestartPolicy {
            name: Some(restart_policy_name(p)),
            maximum_retry_count: None,
        }),
        ..HostConfig::default()
    };

    Config {
        image: Some(request.image.clone()),
        tty: Some(request.tty),
        working_dir: request.working_dir.clone(),
        entrypoint: non_empty(&request.entrypoint),
        cmd: non_empty(&request.cmd),
        env: non_empty(&request.env),
        stop_signal: request.stop_signal.clone(),
        exposed_ports: (!exposed_ports.is_empty()).then_some(exposed_ports),
        host_config: Some(host_config),
        ..Config::default()
    }
}

/// Renders one progress record as a display line.
fn progress_line(status: Option<&str>, progress: Option<&str>, id: Option<&str>) -> Option<String> {
    let status = status?;
    let mut line = String::new();
    if let Some(id) = id {
        line.push_str(id);
        line.push_str(": ");
    }
    line.push_str(status);
    if let Some(progress) = progress {
        line.push(' ');
        line.push_str(progress);
    }
    Some(line)
}

#[async_trait]
impl RuntimeClient for DockerRuntime {
    async fn list_image_tags(&self) -> Result<Vec<String>> {
        let images = self
            .docker
            .list_images(Some(ListImagesOptions::<String> {
                all: false,
                ..Default::default()
            }))
            .await
            .map_err(BerthError::runtime)?;
        Ok(images.into_iter().flat_map(|i| i.repo_tags).collect())
    }

    async fn list_containers(&self) -> Result<Vec<ContainerSummary>> {
        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions::<String> {
                all: true,
                ..Default::default()
            }))
            .await
            .map_err(BerthError::runtime)?;
        Ok(containers
            .into_iter()
            .filter_map(|c| {
                let id = ContainerId::new(c.id?);
                let names = c
                    .names
                    .unwrap_or_default()
                    .iter()
                    .map(|n| ContainerName::new(n))
                    .collect();
                Some(ContainerSummary { id, names })
            })
            .collect())
    }

    async fn create_container(&self, request: &CreateContainerRequest) -> Result<CreatedContainer> {
        let options = CreateContainerOptions {
            name: request.name.clone(),
            platform: None,
        };
        let response = self
            .docker
            .create_container(Some(options), container_config(request))
            .await
            .map_err(BerthError::runtime)?;
        Ok(CreatedContainer {
            id: ContainerId::new(response.id),
            warnings: response.warnings,
        })
    }

    async fn start_container(&self, id: &ContainerId) -> Result<()> {
        self.docker
            .start_container(id.as_str(), None::<StartContainerOptions<String>>)
            .await
            .map_err(BerthError::runtime)
    }

    async fn is_running(&self, id: &ContainerId) -> Result<bool> {
        let info = self
            .docker
            .inspect_container(id.as_str(), None::<InspectContainerOptions>)
            .await
            .map_err(BerthError::runtime)?;
        Ok(info.state.and_then(|s| s.running).unwrap_or(false))
    }

    async fn exec(
        &self,
        id: &ContainerId,
        user: Option<&str>,
        cmd: &[String],
    ) -> Result<ExecOutput> {
        let exec = self
            .docker
            .create_exec(
                id.as_str(),
                CreateExecOptions {
                    cmd: Some(cmd.to_vec()),
                    user: user.map(str::to_string),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .map_err(BerthError::runtime)?;

        let mut output = ExecOutput::default();
        if let StartExecResults::Attached { output: mut stream, .. } = self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(BerthError::runtime)?
        {
            while let Some(chunk) = stream.next().await {
                match chunk.map_err(BerthError::runtime)? {
                    LogOutput::StdOut { message } => {
                        output.stdout.push_str(&String::from_utf8_lossy(&message));
                    }
                    LogOutput::StdErr { message } => {
                        output.stderr.push_str(&String::from_utf8_lossy(&message));
                    }
                    _ => {}
                }
            }
        }

        let inspect = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .map_err(BerthError::runtime)?;
        output.exit_code = inspect.exit_code.unwrap_or(-1);
        Ok(output)
    }

    async fn pull_image(&self, reference: &str, output: &FanOut) -> Result<()> {
        tracing::info!(image = %reference, "pulling image");
        let options = CreateImageOptions {
            from_image: reference.to_string(),
            ..Default::default()
        };
        let mut stream = self.docker.create_image(Some(options), None, None);
        while let Some(item) = stream.next().await {
            let info = item.map_err(|e| BerthError::Pull {
                reference: reference.to_string(),
                message: e.to_string(),
            })?;
            if let Some(message) = info.error {
                return Err(BerthError::Pull {
                    reference: reference.to_string(),
                    message,
                });
            }
            if let Some(line) = progress_line(
                info.status.as_deref(),
                info.progress.as_deref(),
                info.id.as_deref(),
            ) {
                output.write_line(&line);
            }
        }
        Ok(())
    }

    async fn build_image(
        &self,
        context: Vec<u8>,
        options: &BuildOptions,
        output: &FanOut,
    ) -> Result<()> {
        tracing::info!(image = %options.tag, dockerfile = %options.dockerfile, "building image");
        let build_options = BuildImageOptions {
            dockerfile: options.dockerfile.clone(),
            t: options.tag.clone(),
            rm: true,
            forcerm: options.force_rm,
            squash: options.squash,
            buildargs: options
                .build_args
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            ..Default::default()
        };
        let build_error = |message: String| BerthError::Build {
            reference: options.tag.clone(),
            message,
        };

        let mut stream = self
            .docker
            .build_image(build_options, None, Some(Bytes::from(context)));
        while let Some(item) = stream.next().await {
            let info = item.map_err(|e| build_error(e.to_string()))?;
            if let Some(message) = info.error {
                output.write_line(&message);
                return Err(build_error(message));
            }
            if let Some(text) = info.stream {
                output.write_bytes(text.as_bytes());
            } else if let Some(line) = progress_line(
                info.status.as_deref(),
                info.progress.as_deref(),
                info.id.as_deref(),
            ) {
                output.write_line(&line);
            }
        }
        Ok(())
    }
}
