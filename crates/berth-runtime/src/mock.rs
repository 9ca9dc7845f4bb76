//! In-memory runtime for tests and dry runs.

use std::collections::{BTreeSet, HashSet};
use std::io::Write;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use berth_common::error::{BerthError, Result};
use berth_common::types::{ContainerId, ContainerName};

use crate::client::{
    BuildOptions, ContainerSummary, CreateContainerRequest, CreatedContainer, RuntimeClient,
};
use crate::exec::ExecOutput;
use crate::fanout::FanOut;

/// A container held by [`MockRuntime`].
#[derive(Debug, Clone)]
pub struct MockContainer {
    /// Assigned ID.
    pub id: ContainerId,
    /// Name without the leading `/`.
    pub name: ContainerName,
    /// Whether it is running.
    pub running: bool,
    /// The request it was created from, if created through the client.
    pub request: Option<CreateContainerRequest>,
}

/// One recorded image build.
#[derive(Debug, Clone)]
pub struct BuildRecord {
    /// Options passed to the build.
    pub options: BuildOptions,
    /// The tar context as sent.
    pub context: Vec<u8>,
}

/// One recorded exec call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecCall {
    /// Target container.
    pub container: ContainerId,
    /// User the command ran as.
    pub user: Option<String>,
    /// Command argv.
    pub cmd: Vec<String>,
}

type ExecHandler = Box<dyn Fn(&ExecCall) -> ExecOutput + Send + Sync>;

#[derive(Default)]
struct MockState {
    next_id: u64,
    images: BTreeSet<String>,
    containers: Vec<MockContainer>,
    pulls: Vec<String>,
    builds: Vec<BuildRecord>,
    execs: Vec<ExecCall>,
    failing_pulls: HashSet<String>,
    failing_builds: HashSet<String>,
    failing_starts: bool,
    list_images_error: Option<String>,
    exec_delay: Option<Duration>,
}

/// A [`RuntimeClient`] that keeps images and containers in memory.
///
/// Pulls and builds succeed and register the image unless marked failing.
#[derive(Default)]
pub struct MockRuntime {
    state: Mutex<MockState>,
    exec_handler: Mutex<Option<ExecHandler>>,
}

impl MockRuntime {
    /// Creates an empty runtime.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_id(state: &mut MockState) -> ContainerId {
        state.next_id += 1;
        ContainerId::new(format!("mock{:012x}", state.next_id))
    }

    /// Registers a local image tag.
    pub fn add_image(&self, tag: &str) {
        let _ = self.state().images.insert(tag.to_string());
    }

    /// Registers an existing container and returns its ID.
    pub fn add_container(&self, name: &str, running: bool) -> ContainerId {
        let mut state = self.state();
        let id = Self::next_id(&mut state);
        state.containers.push(MockContainer {
            id: id.clone(),
            name: ContainerName::new(name),
            running,
            request: None,
        });
        id
    }

    /// Makes pulls of `reference` fail.
    pub fn fail_pull(&self, reference: &str) {
        let _ = self.state().failing_pulls.insert(reference.to_string());
    }

    /// Makes builds tagged `tag` fail.
    pub fn fail_build(&self, tag: &str) {
        let _ = self.state().failing_builds.insert(tag.to_string());
    }

    /// Makes every container start fail.
    pub fn fail_starts(&self) {
        self.state().failing_starts = true;
    }

    /// Makes image listing fail with `message`.
    pub fn fail_list_images(&self, message: &str) {
        self.state().list_images_error = Some(message.to_string());
    }

    /// Makes every exec take `delay` before answering.
    pub fn delay_execs(&self, delay: Duration) {
        self.state().exec_delay = Some(delay);
    }

    /// Installs the function that answers exec calls.
    ///
    /// Without a handler every exec succeeds with empty output.
    pub fn on_exec(&self, handler: impl Fn(&ExecCall) -> ExecOutput + Send + Sync + 'static) {
        *self
            .exec_handler
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Box::new(handler));
    }

    /// Returns whether an image tag is present.
    #[must_use]
    pub fn has_image(&self, tag: &str) -> bool {
        self.state().images.contains(tag)
    }

    /// Returns every pull reference attempted, in order.
    #[must_use]
    pub fn pulls(&self) -> Vec<String> {
        self.state().pulls.clone()
    }

    /// Returns every build attempted, in order.
    #[must_use]
    pub fn builds(&self) -> Vec<BuildRecord> {
        self.state().builds.clone()
    }

    /// Returns every exec call, in order.
    #[must_use]
    pub fn exec_calls(&self) -> Vec<ExecCall> {
        self.state().execs.clone()
    }

    /// Returns the containers currently known.
    #[must_use]
    pub fn containers(&self) -> Vec<MockContainer> {
        self.state().containers.clone()
    }
}

#[async_trait]
impl RuntimeClient for MockRuntime {
    async fn list_image_tags(&self) -> Result<Vec<String>> {
        let state = self.state();
        if let Some(message) = &state.list_images_error {
            return Err(BerthError::runtime(message));
        }
        Ok(state.images.iter().cloned().collect())
    }

    async fn list_containers(&self) -> Result<Vec<ContainerSummary>> {
        Ok(self
            .state()
            .containers
            .iter()
            .map(|c| ContainerSummary {
                id: c.id.clone(),
                names: vec![ContainerName::new(&c.name.runtime_form())],
            })
            .collect())
    }

    async fn create_container(&self, request: &CreateContainerRequest) -> Result<CreatedContainer> {
        let mut state = self.state();
        let name = ContainerName::new(&request.name);
        if state.containers.iter().any(|c| c.name == name) {
            return Err(BerthError::runtime(format!("container name {name} in use")));
        }
        if !state.images.contains(&request.image) {
            return Err(BerthError::NotFound {
                kind: "image",
                id: request.image.clone(),
            });
        }
        let id = Self::next_id(&mut state);
        state.containers.push(MockContainer {
            id: id.clone(),
            name,
            running: false,
            request: Some(request.clone()),
        });
        Ok(CreatedContainer {
            id,
            warnings: Vec::new(),
        })
    }

    async fn start_container(&self, id: &ContainerId) -> Result<()> {
        let mut state = self.state();
        if state.failing_starts {
            return Err(BerthError::runtime("start refused"));
        }
        let container = state
            .containers
            .iter_mut()
            .find(|c| &c.id == id)
            .ok_or_else(|| BerthError::NotFound {
                kind: "container",
                id: id.to_string(),
            })?;
        container.running = true;
        Ok(())
    }

    async fn is_running(&self, id: &ContainerId) -> Result<bool> {
        self.state()
            .containers
            .iter()
            .find(|c| &c.id == id)
            .map(|c| c.running)
            .ok_or_else(|| BerthError::NotFound {
                kind: "container",
                id: id.to_string(),
            })
    }

    async fn exec(
        &self,
        id: &ContainerId,
        user: Option<&str>,
        cmd: &[String],
    ) -> Result<ExecOutput> {
        let call = ExecCall {
            container: id.clone(),
            user: user.map(str::to_string),
            cmd: cmd.to_vec(),
        };
        let delay = {
            let mut state = self.state();
            state.execs.push(call.clone());
            state.exec_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let handler = self
            .exec_handler
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Ok(handler.as_ref().map(|h| h(&call)).unwrap_or_default())
    }

    async fn pull_image(&self, reference: &str, output: &FanOut) -> Result<()> {
        let mut state = self.state();
        state.pulls.push(reference.to_string());
        output.write_line(&format!("pulling {reference}"));
        if state.failing_pulls.contains(reference) {
            return Err(BerthError::Pull {
                reference: reference.to_string(),
                message: "manifest unknown".into(),
            });
        }
        let _ = state.images.insert(reference.to_string());
        Ok(())
    }

    async fn build_image(
        &self,
        context: Vec<u8>,
        options: &BuildOptions,
        output: &FanOut,
    ) -> Result<()> {
        let mut state = self.state();
        state.builds.push(BuildRecord {
            options: options.clone(),
            context,
        });
        output.write_line(&format!("building {}", options.tag));
        if state.failing_builds.contains(&options.tag) {
            return Err(BerthError::Build {
                reference: options.tag.clone(),
                message: "step failed".into(),
            });
        }
        let _ = state.images.insert(options.tag.clone());
        Ok(())
    }
}

/// A cloneable in-memory writer for observing sink output in tests.
#[derive(Debug, Clone, Default)]
pub struct CaptureBuffer {
    data: Arc<Mutex<Vec<u8>>>,
}

impl CaptureBuffer {
    /// Creates an empty buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns everything written so far.
    #[must_use]
    pub fn contents(&self) -> String {
        let data = self.data.lock().unwrap_or_else(PoisonError::into_inner);
        String::from_utf8_lossy(&data).into_owned()
    }
}

impl Write for CaptureBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.data
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pull_registers_image() {
        let runtime = MockRuntime::new();
        let sink = FanOut::new();
        runtime.pull_image("alpine:3.10", &sink).await.expect("pull");
        assert!(runtime.has_image("alpine:3.10"));
        assert_eq!(runtime.pulls(), vec!["alpine:3.10"]);
    }

    #[tokio::test]
    async fn create_requires_image_and_unique_name() {
        let runtime = MockRuntime::new();
        let request = CreateContainerRequest {
            name: "core".into(),
            image: "core:latest".into(),
            ..CreateContainerRequest::default()
        };
        assert!(runtime.create_container(&request).await.is_err());
        runtime.add_image("core:latest");
        let created = runtime.create_container(&request).await.expect("create");
        assert!(!runtime.is_running(&created.id).await.expect("inspect"));
        assert!(runtime.create_container(&request).await.is_err());
    }

    #[tokio::test]
    async fn listed_names_carry_runtime_slash() {
        let runtime = MockRuntime::new();
        let _ = runtime.add_container("core", true);
        let listed = runtime.list_containers().await.expect("list");
        assert_eq!(listed[0].names[0], ContainerName::new("/core"));
    }
}
