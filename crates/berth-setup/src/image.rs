//! Image setup: make sure a tagged image exists, pulling or building it
//! according to its pull policy.

use std::sync::Arc;

use async_trait::async_trait;
use berth_common::config::{BuildSpec, ImageSpec, PullPolicy, PullSpec};
use berth_common::error::{BerthError, JobResult, Result, SharedError};
use berth_image::builder::ImageBuild;
use berth_runtime::logs::TracingWriter;
use berth_runtime::{FanOut, RuntimeClient};

use crate::job::{Completion, Observer, SetupJob};

/// Provisions one image.
pub struct ImageSetup {
    name: String,
    spec: ImageSpec,
    runtime: Arc<dyn RuntimeClient>,
    builder: Arc<dyn ImageBuild>,
    output: Arc<FanOut>,
    done: Completion<()>,
}

impl std::fmt::Debug for ImageSetup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageSetup")
            .field("name", &self.name)
            .field("spec", &self.spec)
            .finish_non_exhaustive()
    }
}

impl ImageSetup {
    /// Creates the job for image `name`.
    pub fn new(
        name: impl Into<String>,
        spec: ImageSpec,
        runtime: Arc<dyn RuntimeClient>,
        builder: Arc<dyn ImageBuild>,
    ) -> Self {
        Self {
            name: name.into(),
            spec,
            runtime,
            builder,
            output: Arc::new(FanOut::new()),
            done: Completion::new(),
        }
    }

    /// Returns the progress sink of this job.
    #[must_use]
    pub const fn output(&self) -> &Arc<FanOut> {
        &self.output
    }

    async fn exists(&self) -> Result<bool> {
        let tags = self.runtime.list_image_tags().await?;
        Ok(tags.iter().any(|tag| *tag == self.name))
    }

    async fn pull(&self, pull: &PullSpec) -> Result<()> {
        let reference = pull.reference_for(&self.name);
        tracing::info!(image = %self.name, reference = %reference, "pulling image");
        self.runtime.pull_image(&reference, &self.output).await
    }

    async fn build(&self, build: &BuildSpec) -> Result<()> {
        tracing::info!(image = %self.name, source = %build.source, "building image");
        self.builder
            .build_image(&self.name, build, &self.output)
            .await
    }

    async fn build_or(&self, build: Option<&BuildSpec>, error: BerthError) -> Result<()> {
        match build {
            Some(build) => {
                tracing::warn!(image = %self.name, error = %error, "pull failed, building instead");
                self.build(build).await
            }
            None => Err(error),
        }
    }

    async fn converge(&self) -> Result<()> {
        let present = self.exists().await?;
        let pull = self.spec.pull.as_ref();
        let build = self.spec.build.as_ref();
        let policy = pull.map(|p| p.policy).unwrap_or_default();
        tracing::debug!(image = %self.name, present, policy = ?policy, "image state");

        match (policy, pull, build) {
            (PullPolicy::Always, Some(pull), _) => match self.pull(pull).await {
                Ok(()) => Ok(()),
                Err(e) if present => {
                    tracing::warn!(image = %self.name, error = %e, "pull failed, keeping local image");
                    Ok(())
                }
                Err(e) => self.build_or(build, e).await,
            },
            _ if present => Ok(()),
            (PullPolicy::IfBuildFails, pull, Some(build)) => self.build_or_pull(build, pull).await,
            (_, Some(pull), build) => match self.pull(pull).await {
                Ok(()) => Ok(()),
                Err(e) => self.build_or(build, e).await,
            },
            (_, None, Some(build)) => self.build(build).await,
            (_, None, None) => Err(BerthError::NotFound {
                kind: "image",
                id: self.name.clone(),
            }),
        }
    }

    async fn build_or_pull(&self, build: &BuildSpec, pull: Option<&PullSpec>) -> Result<()> {
        let Err(build_error) = self.build(build).await else {
            return Ok(());
        };
        let Some(pull) = pull else {
            return Err(build_error);
        };
        tracing::warn!(image = %self.name, error = %build_error, "build failed, pulling instead");
        if let Err(pull_error) = self.pull(pull).await {
            tracing::warn!(image = %self.name, error = %pull_error, "fallback pull failed");
            return Err(build_error);
        }
        Ok(())
    }
}

#[async_trait]
impl SetupJob for ImageSetup {
    fn kind(&self) -> &'static str {
        "image"
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self) -> JobResult<()> {
        let _log = self.output.attach(Box::new(TracingWriter::new(&self.name)));
        let outcome = self.converge().await.map_err(Arc::new);
        match &outcome {
            Ok(()) => tracing::info!(image = %self.name, "image ready"),
            Err(e) => self
                .output
                .write_line(&format!("image setup failed: {e}")),
        }
        self.output.flush_all();
        let _ = self.done.finish(outcome.clone());
        outcome
    }

    async fn wait(&self, observer: Option<Observer>) -> JobResult<()> {
        let _attached = observer.map(|observer| self.output.attach(observer));
        self.done.wait().await
    }

    fn abandon(&self, error: SharedError) {
        let _ = self.done.finish(Err(error));
    }
}

#[cfg(test)]
mod tests {
    use berth_runtime::mock::{CaptureBuffer, MockRuntime};

    use super::*;

    #[derive(Default)]
    struct FakeBuilder {
        fail: bool,
        calls: std::sync::Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ImageBuild for FakeBuilder {
        async fn build_image(&self, tag: &str, _spec: &BuildSpec, output: &Arc<FanOut>) -> Result<()> {
            self.calls.lock().unwrap().push(tag.to_string());
            output.write_line(&format!("Step 1/1 : building {tag}"));
            if self.fail {
                return Err(BerthError::Build {
                    reference: tag.to_string(),
                    message: "step failed".into(),
                });
            }
            Ok(())
        }
    }

    fn spec(policy: Option<PullPolicy>, build: bool) -> ImageSpec {
        ImageSpec {
            pull: policy.map(|policy| PullSpec {
                policy,
                registry: None,
            }),
            build: build.then(|| BuildSpec {
                source: "/src".into(),
                ..BuildSpec::default()
            }),
        }
    }

    fn job(
        runtime: &Arc<MockRuntime>,
        builder: &Arc<FakeBuilder>,
        spec: ImageSpec,
    ) -> ImageSetup {
        ImageSetup::new("app:1", spec, runtime.clone(), builder.clone())
    }

    #[tokio::test]
    async fn if_build_fails_pulls_once_after_failed_build() {
        let runtime = Arc::new(MockRuntime::new());
        runtime.fail_pull("app:1");
        let builder = Arc::new(FakeBuilder {
            fail: true,
            ..FakeBuilder::default()
        });
        let setup = job(&runtime, &builder, spec(Some(PullPolicy::IfBuildFails), true));

        let err = setup.execute().await.unwrap_err();
        assert!(matches!(*err, BerthError::Build { .. }), "got {err}");
        assert_eq!(runtime.pulls(), vec!["app:1"]);
        assert_eq!(builder.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn if_build_fails_never_pulls_after_good_build() {
        let runtime = Arc::new(MockRuntime::new());
        let builder = Arc::new(FakeBuilder::default());
        let setup = job(&runtime, &builder, spec(Some(PullPolicy::IfBuildFails), true));
        setup.execute().await.expect("build");
        assert!(runtime.pulls().is_empty());
    }

    #[tokio::test]
    async fn if_build_fails_without_build_pulls() {
        let runtime = Arc::new(MockRuntime::new());
        let builder = Arc::new(FakeBuilder::default());
        let setup = job(&runtime, &builder, spec(Some(PullPolicy::IfBuildFails), false));
        setup.execute().await.expect("pull");
        assert_eq!(runtime.pulls(), vec!["app:1"]);
    }

    #[tokio::test]
    async fn if_not_present_skips_present_image() {
        let runtime = Arc::new(MockRuntime::new());
        runtime.add_image("app:1");
        let builder = Arc::new(FakeBuilder::default());
        let setup = job(&runtime, &builder, spec(Some(PullPolicy::IfNotPresent), true));
        setup.execute().await.expect("present");
        assert!(runtime.pulls().is_empty());
        assert!(builder.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn if_not_present_builds_after_failed_pull() {
        let runtime = Arc::new(MockRuntime::new());
        runtime.fail_pull("app:1");
        let builder = Arc::new(FakeBuilder::default());
        let setup = job(&runtime, &builder, spec(Some(PullPolicy::IfNotPresent), true));
        setup.execute().await.expect("built");
        assert_eq!(runtime.pulls(), vec!["app:1"]);
        assert_eq!(*builder.calls.lock().unwrap(), vec!["app:1"]);
    }

    #[tokio::test]
    async fn always_pulls_present_image_and_tolerates_failure() {
        let runtime = Arc::new(MockRuntime::new());
        runtime.add_image("app:1");
        runtime.fail_pull("app:1");
        let builder = Arc::new(FakeBuilder::default());
        let setup = job(&runtime, &builder, spec(Some(PullPolicy::Always), true));
        setup.execute().await.expect("kept local");
        assert_eq!(runtime.pulls(), vec!["app:1"]);
        assert!(builder.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn always_builds_when_absent_and_pull_fails() {
        let runtime = Arc::new(MockRuntime::new());
        runtime.fail_pull("app:1");
        let builder = Arc::new(FakeBuilder::default());
        let setup = job(&runtime, &builder, spec(Some(PullPolicy::Always), true));
        setup.execute().await.expect("built");
        assert_eq!(builder.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn registry_prefixes_pull_reference() {
        let runtime = Arc::new(MockRuntime::new());
        let builder = Arc::new(FakeBuilder::default());
        let spec = ImageSpec {
            pull: Some(PullSpec {
                policy: PullPolicy::IfNotPresent,
                registry: Some("registry.local:5000".into()),
            }),
            build: None,
        };
        job(&runtime, &builder, spec).execute().await.expect("pull");
        assert_eq!(runtime.pulls(), vec!["registry.local:5000/app:1"]);
    }

    #[tokio::test]
    async fn nothing_declared_fails_when_absent() {
        let runtime = Arc::new(MockRuntime::new());
        let builder = Arc::new(FakeBuilder::default());
        let setup = job(&runtime, &builder, spec(None, false));
        let err = setup.execute().await.unwrap_err();
        assert!(matches!(*err, BerthError::NotFound { .. }));

        runtime.add_image("app:1");
        let again = job(&runtime, &builder, spec(None, false));
        again.execute().await.expect("present");
    }

    #[tokio::test]
    async fn list_failure_fails_job() {
        let runtime = Arc::new(MockRuntime::new());
        runtime.fail_list_images("daemon down");
        let builder = Arc::new(FakeBuilder::default());
        let setup = job(&runtime, &builder, spec(Some(PullPolicy::Always), true));
        let err = setup.execute().await.unwrap_err();
        assert!(err.to_string().contains("daemon down"));
        assert!(runtime.pulls().is_empty());
    }

    #[tokio::test]
    async fn observer_sees_progress_and_failure_trailer() {
        let runtime = Arc::new(MockRuntime::new());
        runtime.fail_pull("app:1");
        let builder = Arc::new(FakeBuilder::default());
        let setup = Arc::new(job(&runtime, &builder, spec(Some(PullPolicy::IfNotPresent), false)));

        let capture = CaptureBuffer::new();
        let waiter = {
            let setup = Arc::clone(&setup);
            let observer: Observer = Box::new(capture.clone());
            tokio::spawn(async move { setup.wait(Some(observer)).await })
        };
        while setup.output().is_empty() {
            tokio::task::yield_now().await;
        }
        let _ = setup.execute().await;
        assert!(waiter.await.expect("join").is_err());

        let log = capture.contents();
        assert!(log.contains("pulling app:1"), "got {log}");
        assert!(log.contains("image setup failed: cannot pull app:1"), "got {log}");
        assert!(setup.output().is_empty());
        assert!(setup.wait(None).await.is_err());
    }
}
