//! The orchestrator: one job per declared image, container, and user, all
//! started at once.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use berth_common::config::{Config, ImageSpec, PullSpec};
use berth_common::error::{BerthError, JobResult, Result};
use berth_common::types::ContainerId;
use berth_image::builder::ImageBuild;
use berth_runtime::RuntimeClient;
use berth_runtime::exec::{ExecOutput, exec_in_container};

use crate::container::ContainerSetup;
use crate::host::HostAccounts;
use crate::image::ImageSetup;
use crate::job::{Observer, SetupJob, run_all};
use crate::user::UserSetup;
use crate::waiter::{ContainerWaiter, ImageWaiter};

fn unknown(kind: &'static str, name: &str) -> Arc<BerthError> {
    Arc::new(BerthError::NotFound {
        kind,
        id: name.to_string(),
    })
}

/// Image jobs by image name.
#[derive(Debug, Default)]
pub struct ImageJobs {
    jobs: BTreeMap<String, Arc<ImageSetup>>,
}

impl ImageJobs {
    /// Returns the job for `name`.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Arc<ImageSetup>> {
        self.jobs.get(name)
    }
}

#[async_trait]
impl ImageWaiter for ImageJobs {
    async fn wait_for_image(&self, name: &str, observer: Option<Observer>) -> JobResult<()> {
        let job = self.jobs.get(name).ok_or_else(|| unknown("image", name))?;
        job.wait(observer).await
    }
}

/// Container jobs by container name.
pub struct ContainerJobs {
    jobs: BTreeMap<String, Arc<ContainerSetup>>,
    runtime: Arc<dyn RuntimeClient>,
}

impl std::fmt::Debug for ContainerJobs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerJobs")
            .field("jobs", &self.jobs)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl ContainerWaiter for ContainerJobs {
    fn check_has_container(&self, name: &str) -> bool {
        self.jobs.contains_key(name)
    }

    async fn wait_for_container(
        &self,
        name: &str,
        observer: Option<Observer>,
    ) -> JobResult<ContainerId> {
        let job = self
            .jobs
            .get(name)
            .ok_or_else(|| unknown("container", name))?;
        job.wait_id(observer).await
    }

    async fn exec_cmd_container(
        &self,
        id: &ContainerId,
        user: Option<&str>,
        command: &[String],
    ) -> Result<ExecOutput> {
        exec_in_container(self.runtime.as_ref(), id, user, command).await
    }
}

/// Converges a [`Config`] against a runtime and the host.
#[derive(Debug)]
pub struct Setup {
    images: Arc<ImageJobs>,
    containers: Arc<ContainerJobs>,
    users: Vec<Arc<UserSetup>>,
}

impl Setup {
    /// Builds every job for `config`.
    ///
    /// Containers whose image is not declared get a pull-only image job.
    /// Missing host accounts are created only with `create_users`.
    pub fn new(
        config: &Config,
        create_users: bool,
        runtime: Arc<dyn RuntimeClient>,
        builder: Arc<dyn ImageBuild>,
        accounts: Arc<dyn HostAccounts>,
    ) -> Self {
        let mut image_specs = config.images.clone();
        for (name, container) in &config.containers {
            if !image_specs.contains_key(&container.image) && !container.image.is_empty() {
                tracing::debug!(container = %name, image = %container.image, "image not declared, pulling it");
                let _ = image_specs.insert(
                    container.image.clone(),
                    ImageSpec {
                        pull: Some(PullSpec::default()),
                        build: None,
                    },
                );
            }
        }

        let images = Arc::new(ImageJobs {
            jobs: image_specs
                .into_iter()
                .map(|(name, spec)| {
                    let job = ImageSetup::new(
                        name.clone(),
                        spec,
                        Arc::clone(&runtime),
                        Arc::clone(&builder),
                    );
                    (name, Arc::new(job))
                })
                .collect(),
        });

        let image_waiter: Arc<dyn ImageWaiter> = images.clone();
        let containers = Arc::new(ContainerJobs {
            jobs: config
                .containers
                .iter()
                .map(|(name, spec)| {
                    let job = ContainerSetup::new(
                        name.clone(),
                        spec.clone(),
                        Arc::clone(&runtime),
                        Arc::clone(&image_waiter),
                    );
                    (name.clone(), Arc::new(job))
                })
                .collect(),
            runtime,
        });

        let container_waiter: Arc<dyn ContainerWaiter> = containers.clone();
        let users = config
            .users
            .iter()
            .map(|(name, spec)| {
                Arc::new(UserSetup::new(
                    name.clone(),
                    spec.clone(),
                    create_users,
                    Arc::clone(&container_waiter),
                    Arc::clone(&accounts),
                ))
            })
            .collect();

        Self {
            images,
            containers,
            users,
        }
    }

    /// Returns the number of jobs.
    #[must_use]
    pub fn job_count(&self) -> usize {
        self.images.jobs.len() + self.containers.jobs.len() + self.users.len()
    }

    /// Returns the image job for `name`.
    #[must_use]
    pub fn image_job(&self, name: &str) -> Option<&Arc<ImageSetup>> {
        self.images.get(name)
    }

    /// Runs every job and waits for all of them.
    ///
    /// # Errors
    ///
    /// Returns the first job error observed, after every job finished.
    pub async fn execute(&self) -> JobResult<()> {
        let mut jobs: Vec<Arc<dyn SetupJob>> = Vec::with_capacity(self.job_count());
        jobs.extend(self.images.jobs.values().map(|j| Arc::clone(j) as Arc<dyn SetupJob>));
        jobs.extend(self.containers.jobs.values().map(|j| Arc::clone(j) as Arc<dyn SetupJob>));
        jobs.extend(self.users.iter().map(|j| Arc::clone(j) as Arc<dyn SetupJob>));
        tracing::info!(jobs = jobs.len(), "starting setup");
        run_all(jobs).await
    }

    /// Waits for the image job `name`.
    ///
    /// # Errors
    ///
    /// Returns the job error, or not-found for an undeclared image.
    pub async fn wait_for_image(&self, name: &str, observer: Option<Observer>) -> JobResult<()> {
        self.images.wait_for_image(name, observer).await
    }

    /// Waits for the container job `name` and returns its container ID.
    ///
    /// # Errors
    ///
    /// Returns the job error, or not-found for an undeclared container.
    pub async fn wait_for_container(
        &self,
        name: &str,
        observer: Option<Observer>,
    ) -> JobResult<ContainerId> {
        self.containers.wait_for_container(name, observer).await
    }

    /// Returns whether a container named `name` is declared.
    #[must_use]
    pub fn check_has_container(&self, name: &str) -> bool {
        self.containers.check_has_container(name)
    }

    /// Runs a one-shot command in a container, starting it if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the exec fails.
    pub async fn exec_cmd_container(
        &self,
        id: &ContainerId,
        user: Option<&str>,
        command: &[String],
    ) -> Result<ExecOutput> {
        self.containers.exec_cmd_container(id, user, command).await
    }
}
