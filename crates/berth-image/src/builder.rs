//! Image builds.
//!
//! A build fetches its source into a scratch directory, then either sends
//! the whole context to the runtime in one build, or, for scratch builds,
//! resolves the `FROM` chain, rebases it for the target architecture, and
//! builds every layer bottom-up.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use berth_common::config::BuildSpec;
use berth_common::constants::DEFAULT_DOCKERFILE;
use berth_common::error::{BerthError, Result};
use berth_runtime::FanOut;
use berth_runtime::client::{BuildOptions, RuntimeClient};
use tempfile::TempDir;

use crate::arch::Arch;
use crate::context::pack_context;
use crate::library::LibraryCache;
use crate::source::{DefaultFetcher, SourceFetcher};
use crate::stack::ImageStack;

/// Something that can produce an image from a [`BuildSpec`].
#[async_trait]
pub trait ImageBuild: Send + Sync {
    /// Builds `spec` and tags the result `tag`, streaming progress into
    /// `output`.
    ///
    /// # Errors
    ///
    /// Returns an error if fetching, packing, or any runtime build fails.
    async fn build_image(&self, tag: &str, spec: &BuildSpec, output: &Arc<FanOut>) -> Result<()>;
}

/// Builds images through a [`RuntimeClient`].
pub struct Builder {
    runtime: Arc<dyn RuntimeClient>,
    fetcher: Arc<dyn SourceFetcher>,
    library: Arc<LibraryCache>,
    arch: Option<Arch>,
}

impl std::fmt::Debug for Builder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Builder")
            .field("arch", &self.arch)
            .finish_non_exhaustive()
    }
}

fn join_error(reference: &str, e: &tokio::task::JoinError) -> BerthError {
    BerthError::Build {
        reference: reference.to_string(),
        message: format!("build task failed: {e}"),
    }
}

fn resolve_build_args(args: &BTreeMap<String, Option<String>>) -> BTreeMap<String, String> {
    args.iter()
        .filter_map(|(k, v)| {
            v.clone()
                .or_else(|| std::env::var(k).ok())
                .map(|v| (k.clone(), v))
        })
        .collect()
}

impl Builder {
    /// Creates a builder using the default fetchers and the process-wide
    /// library cache.
    #[must_use]
    pub fn new(runtime: Arc<dyn RuntimeClient>) -> Self {
        Self {
            runtime,
            fetcher: Arc::new(DefaultFetcher),
            library: LibraryCache::global(),
            arch: None,
        }
    }

    /// Replaces the source fetcher.
    #[must_use]
    pub fn with_fetcher(mut self, fetcher: Arc<dyn SourceFetcher>) -> Self {
        self.fetcher = fetcher;
        self
    }

    /// Replaces the library cache used by scratch builds.
    #[must_use]
    pub fn with_library(mut self, library: Arc<LibraryCache>) -> Self {
        self.library = library;
        self
    }

    /// Targets `arch` instead of the host architecture.
    #[must_use]
    pub const fn with_arch(mut self, arch: Arch) -> Self {
        self.arch = Some(arch);
        self
    }

    /// Fetches the source of `spec` into `destination`.
    ///
    /// # Errors
    ///
    /// Returns an error if the source is empty, unrecognized, or the
    /// transfer fails.
    pub async fn fetch_source(&self, spec: &BuildSpec, destination: &Path) -> Result<()> {
        let fetcher = Arc::clone(&self.fetcher);
        let source = spec.source.clone();
        let destination = destination.to_path_buf();
        tokio::task::spawn_blocking(move || fetcher.fetch(&source, &destination))
            .await
            .map_err(|e| join_error(&spec.source, &e))?
    }

    /// Builds `spec` from an already fetched source tree at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the Dockerfile cannot be read or a build fails.
    pub async fn build_at(
        &self,
        path: &Path,
        tag: &str,
        spec: &BuildSpec,
        output: &Arc<FanOut>,
    ) -> Result<()> {
        let context = path.join(spec.root.as_deref().unwrap_or("."));
        let dockerfile = PathBuf::from(spec.dockerfile.as_deref().unwrap_or(DEFAULT_DOCKERFILE));
        let options = BuildOptions {
            tag: tag.to_string(),
            dockerfile: String::new(),
            force_rm: !spec.preserve_intermediate,
            squash: spec.squash,
            build_args: resolve_build_args(&spec.build_args),
        };
        if spec.scratch_build {
            self.build_layered(context, dockerfile, options, output).await
        } else {
            self.build_direct(context, dockerfile, options, output).await
        }
    }

    async fn build_direct(
        &self,
        context: PathBuf,
        dockerfile: PathBuf,
        mut options: BuildOptions,
        output: &FanOut,
    ) -> Result<()> {
        tracing::info!(image = %options.tag, context = %context.display(), "building image");
        let packed = tokio::task::spawn_blocking(move || {
            let df_path = context.join(&dockerfile);
            let text =
                std::fs::read_to_string(&df_path).map_err(|e| BerthError::io(&df_path, e))?;
            pack_context(&context, &dockerfile, &text)
        })
        .await
        .map_err(|e| join_error(&options.tag, &e))??;
        options.dockerfile = packed.dockerfile;
        self.runtime
            .build_image(packed.archive, &options, output)
            .await
    }

    async fn build_layered(
        &self,
        context: PathBuf,
        dockerfile: PathBuf,
        options: BuildOptions,
        output: &Arc<FanOut>,
    ) -> Result<()> {
        let arch = self.arch.unwrap_or_else(Arch::detect);
        tracing::info!(image = %options.tag, arch = %arch, "scratch build");

        let library = Arc::clone(&self.library);
        let tag = options.tag.clone();
        let (lease, stack) = tokio::task::spawn_blocking(move || -> Result<_> {
            let lease = library.acquire()?;
            let stack = ImageStack::for_arch(&context, &dockerfile, &tag, &lease, arch)?;
            Ok((lease, stack))
        })
        .await
        .map_err(|e| join_error(&options.tag, &e))??;

        output.write_line(&format!("layer stack: {stack}"));
        let task = tokio::spawn(build_stack(
            Arc::clone(&self.runtime),
            stack,
            options.clone(),
            Arc::clone(output),
        ));
        let result = task.await.map_err(|e| join_error(&options.tag, &e));
        let _ = tokio::task::spawn_blocking(move || drop(lease)).await;
        result?
    }
}

async fn build_stack(
    runtime: Arc<dyn RuntimeClient>,
    stack: ImageStack,
    options: BuildOptions,
    output: Arc<FanOut>,
) -> Result<()> {
    stack.ensure_buildable()?;

    if let Some(bottom) = stack.bottom().filter(|b| b.is_pull_target()) {
        let reference = bottom.reference.to_string();
        output.write_line(&format!("pulling base {reference}"));
        runtime.pull_image(&reference, &output).await?;
    }

    let target = stack.layers().first();
    for layer in stack.build_order() {
        let (Some(dockerfile), Some(path)) = (layer.dockerfile.as_ref(), layer.path.clone()) else {
            continue;
        };
        let is_target = target.is_some_and(|t| std::ptr::eq(t, layer));
        let reference = layer.reference.to_string();
        let text = dockerfile.source();
        output.write_line(&format!("building layer {reference}"));
        output.write_bytes(text.as_bytes());

        let packed = tokio::task::spawn_blocking(move || {
            pack_context(&path, Path::new(DEFAULT_DOCKERFILE), &text)
        })
        .await
        .map_err(|e| join_error(&reference, &e))??;
        let layer_options = if is_target {
            BuildOptions {
                tag: reference,
                dockerfile: packed.dockerfile,
                ..options.clone()
            }
        } else {
            BuildOptions {
                tag: reference,
                dockerfile: packed.dockerfile,
                force_rm: options.force_rm,
                ..BuildOptions::default()
            }
        };
        runtime
            .build_image(packed.archive, &layer_options, &output)
            .await?;
    }
    Ok(())
}

#[async_trait]
impl ImageBuild for Builder {
    async fn build_image(&self, tag: &str, spec: &BuildSpec, output: &Arc<FanOut>) -> Result<()> {
        let workspace = tokio::task::spawn_blocking(|| {
            tempfile::Builder::new()
                .prefix("berth-build-")
                .tempdir()
                .map_err(|e| BerthError::io(std::env::temp_dir(), e))
        })
        .await
        .map_err(|e| join_error(tag, &e))??;
        let source = workspace.path().join("src");
        tracing::info!(image = %tag, source = %spec.source, "fetching build source");
        self.fetch_source(spec, &source).await?;

        let result = self.build_at(&source, tag, spec, output).await;
        let _ = tokio::task::spawn_blocking(move || TempDir::close(workspace)).await;
        result
    }
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use berth_runtime::mock::MockRuntime;

    use super::*;
    use crate::library::LibrarySource;
    use crate::reference::ImageReference;

    struct NoLibrary;

    impl LibrarySource for NoLibrary {
        fn library_source(&self, reference: &ImageReference) -> Result<PathBuf> {
            Err(BerthError::NotFound {
                kind: "library tag",
                id: reference.to_string(),
            })
        }
    }

    fn injected_text(archive: &[u8], name: &str) -> String {
        let mut tar = tar::Archive::new(archive);
        for entry in tar.entries().expect("entries") {
            let mut entry = entry.expect("entry");
            if entry.path().expect("path").to_str() == Some(name) {
                let mut text = String::new();
                let _ = entry.read_to_string(&mut text).expect("read");
                return text;
            }
        }
        panic!("{name} not in context");
    }

    fn spec_for(dir: &Path) -> BuildSpec {
        BuildSpec {
            source: dir.display().to_string(),
            ..BuildSpec::default()
        }
    }

    #[tokio::test]
    async fn direct_build_sends_context_with_dockerfile() {
        let src = tempfile::tempdir().expect("tempdir");
        std::fs::write(src.path().join("Dockerfile"), "FROM alpine\nRUN true\n").expect("write");
        let runtime = Arc::new(MockRuntime::new());
        let builder = Builder::new(runtime.clone());
        let output = Arc::new(FanOut::new());

        builder
            .build_image("app:latest", &spec_for(src.path()), &output)
            .await
            .expect("build");

        let builds = runtime.builds();
        assert_eq!(builds.len(), 1);
        assert_eq!(builds[0].options.tag, "app:latest");
        assert!(builds[0].options.force_rm);
        let text = injected_text(&builds[0].context, &builds[0].options.dockerfile);
        assert_eq!(text, "FROM alpine\nRUN true\n");
        assert!(runtime.pulls().is_empty());
    }

    #[tokio::test]
    async fn root_and_dockerfile_select_context() {
        let src = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir_all(src.path().join("image")).expect("mkdir");
        std::fs::write(src.path().join("image/Dockerfile.arm"), "FROM scratch\n").expect("write");
        let mut spec = spec_for(src.path());
        spec.root = Some("./image".into());
        spec.dockerfile = Some("./Dockerfile.arm".into());
        spec.preserve_intermediate = true;
        spec.build_args = BTreeMap::from([("VERSION".to_string(), Some("1".to_string()))]);

        let runtime = Arc::new(MockRuntime::new());
        Builder::new(runtime.clone())
            .build_image("app:arm", &spec, &Arc::new(FanOut::new()))
            .await
            .expect("build");

        let build = &runtime.builds()[0];
        assert!(!build.options.force_rm);
        assert_eq!(build.options.build_args["VERSION"], "1");
        assert_eq!(
            injected_text(&build.context, &build.options.dockerfile),
            "FROM scratch\n"
        );
    }

    #[tokio::test]
    async fn scratch_build_pulls_substitute_and_builds_rewritten_layer() {
        let src = tempfile::tempdir().expect("tempdir");
        let original = "FROM alpine:3.10\nRUN apk add --no-cache curl\n";
        std::fs::write(src.path().join("Dockerfile"), original).expect("write");
        let cache_parent = tempfile::tempdir().expect("tempdir");
        let library = Arc::new(LibraryCache::new_in(cache_parent.path(), |_| {
            let resolver: Arc<dyn LibrarySource> = Arc::new(NoLibrary);
            Ok(resolver)
        }));
        let mut spec = spec_for(src.path());
        spec.scratch_build = true;

        let runtime = Arc::new(MockRuntime::new());
        let builder = Builder::new(runtime.clone())
            .with_library(Arc::clone(&library))
            .with_arch(Arch::Arm);
        builder
            .build_image("app:latest", &spec, &Arc::new(FanOut::new()))
            .await
            .expect("build");

        assert_eq!(runtime.pulls(), vec!["container4armhf/armhf-alpine:3.10"]);
        let builds = runtime.builds();
        assert_eq!(builds.len(), 1);
        assert_eq!(builds[0].options.tag, "app:latest");
        assert_eq!(
            injected_text(&builds[0].context, &builds[0].options.dockerfile),
            "FROM container4armhf/armhf-alpine:3.10\nRUN apk add --no-cache curl\n"
        );
        assert_eq!(library.ref_count(), 0);
        assert!(library.directory().is_none());
    }

    #[tokio::test]
    async fn failed_pull_fails_scratch_build_and_releases_cache() {
        let src = tempfile::tempdir().expect("tempdir");
        std::fs::write(src.path().join("Dockerfile"), "FROM ubuntu:18.04\n").expect("write");
        let cache_parent = tempfile::tempdir().expect("tempdir");
        let library = Arc::new(LibraryCache::new_in(cache_parent.path(), |_| {
            let resolver: Arc<dyn LibrarySource> = Arc::new(NoLibrary);
            Ok(resolver)
        }));
        let runtime = Arc::new(MockRuntime::new());
        runtime.fail_pull("ioft/armhf-ubuntu:18.04");
        let mut spec = spec_for(src.path());
        spec.scratch_build = true;

        let err = Builder::new(runtime.clone())
            .with_library(Arc::clone(&library))
            .with_arch(Arch::Arm)
            .build_image("app:latest", &spec, &Arc::new(FanOut::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, BerthError::Pull { .. }), "got {err}");
        assert!(runtime.builds().is_empty());
        assert_eq!(library.ref_count(), 0);
    }

    struct DirLibrary {
        sources: BTreeMap<String, PathBuf>,
    }

    impl LibrarySource for DirLibrary {
        fn library_source(&self, reference: &ImageReference) -> Result<PathBuf> {
            self.sources
                .get(&reference.to_string())
                .cloned()
                .ok_or_else(|| BerthError::NotFound {
                    kind: "library tag",
                    id: reference.to_string(),
                })
        }
    }

    fn library_of(sources: BTreeMap<String, PathBuf>, parent: &Path) -> Arc<LibraryCache> {
        let sources = Arc::new(sources);
        Arc::new(LibraryCache::new_in(parent, move |_| {
            let resolver: Arc<dyn LibrarySource> = Arc::new(DirLibrary {
                sources: (*sources).clone(),
            });
            Ok(resolver)
        }))
    }

    #[tokio::test]
    async fn amd64_scratch_build_pulls_library_base_as_is() {
        let src = tempfile::tempdir().expect("tempdir");
        std::fs::write(src.path().join("Dockerfile"), "FROM alpine:3.10\nRUN true\n")
            .expect("write");
        let alpine = tempfile::tempdir().expect("tempdir");
        std::fs::write(alpine.path().join("Dockerfile"), "ARG BASE=scratch\nFROM ${BASE}\n")
            .expect("write");
        let cache_parent = tempfile::tempdir().expect("tempdir");
        let library = library_of(
            BTreeMap::from([("alpine:3.10".to_string(), alpine.path().to_path_buf())]),
            cache_parent.path(),
        );
        let mut spec = spec_for(src.path());
        spec.scratch_build = true;

        let runtime = Arc::new(MockRuntime::new());
        Builder::new(runtime.clone())
            .with_library(library)
            .with_arch(Arch::Amd64)
            .build_image("app:latest", &spec, &Arc::new(FanOut::new()))
            .await
            .expect("build");

        assert_eq!(runtime.pulls(), vec!["alpine:3.10"]);
        let builds = runtime.builds();
        assert_eq!(builds.len(), 1);
        assert_eq!(
            injected_text(&builds[0].context, &builds[0].options.dockerfile),
            "FROM alpine:3.10\nRUN true\n"
        );
    }

    #[tokio::test]
    async fn library_layers_build_without_target_options() {
        let src = tempfile::tempdir().expect("tempdir");
        std::fs::write(src.path().join("Dockerfile"), "FROM nginx:1\nARG VERSION\n")
            .expect("write");
        let nginx = tempfile::tempdir().expect("tempdir");
        std::fs::write(nginx.path().join("Dockerfile"), "FROM scratch\nCOPY . /\n")
            .expect("write");
        let cache_parent = tempfile::tempdir().expect("tempdir");
        let library = library_of(
            BTreeMap::from([("nginx:1".to_string(), nginx.path().to_path_buf())]),
            cache_parent.path(),
        );
        let mut spec = spec_for(src.path());
        spec.scratch_build = true;
        spec.squash = true;
        spec.build_args = BTreeMap::from([("VERSION".to_string(), Some("2".to_string()))]);

        let runtime = Arc::new(MockRuntime::new());
        Builder::new(runtime.clone())
            .with_library(library)
            .with_arch(Arch::Arm)
            .build_image("app:latest", &spec, &Arc::new(FanOut::new()))
            .await
            .expect("build");

        assert!(runtime.pulls().is_empty());
        let builds = runtime.builds();
        let tags: Vec<_> = builds.iter().map(|b| b.options.tag.as_str()).collect();
        assert_eq!(tags, vec!["nginx:1", "app:latest"]);
        assert!(!builds[0].options.squash);
        assert!(builds[0].options.build_args.is_empty());
        assert!(builds[0].options.force_rm);
        assert!(builds[1].options.squash);
        assert_eq!(builds[1].options.build_args["VERSION"], "2");
    }

    #[tokio::test]
    async fn empty_source_is_rejected() {
        let runtime = Arc::new(MockRuntime::new());
        let err = Builder::new(runtime)
            .build_image("app", &BuildSpec::default(), &Arc::new(FanOut::new()))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("empty"));
    }
}
