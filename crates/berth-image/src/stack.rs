//! `FROM`-chain layer stacks.
//!
//! Index 0 is the image being built; each following layer is the base of
//! the one before it. Library bases are expanded through their upstream
//! Dockerfiles until the chain reaches `scratch`, an image whose source
//! cannot be found, or, when resolving for an architecture, the first base
//! that architecture can pull.

use std::fmt;
use std::path::{Path, PathBuf};

use berth_common::error::{BerthError, Result};

use crate::arch::Arch;
use crate::dockerfile::Dockerfile;
use crate::library::LibrarySource;
use crate::reference::ImageReference;

const MAX_DEPTH: usize = 32;

/// One image in a stack.
#[derive(Debug, Clone)]
pub struct Layer {
    /// Image this layer produces.
    pub reference: ImageReference,
    /// Dockerfile that builds it, when the source is known.
    pub dockerfile: Option<Dockerfile>,
    /// Build context directory for `dockerfile`.
    pub path: Option<PathBuf>,
}

impl Layer {
    fn pull_target(reference: ImageReference) -> Self {
        Self {
            reference,
            dockerfile: None,
            path: None,
        }
    }

    /// Returns whether this layer must be pulled rather than built.
    #[must_use]
    pub fn is_pull_target(&self) -> bool {
        self.dockerfile.is_none() && !self.reference.is_scratch()
    }
}

/// A linear chain of images from target down to the deepest known base.
#[derive(Debug, Clone)]
pub struct ImageStack {
    layers: Vec<Layer>,
}

impl ImageStack {
    /// Resolves the stack for the Dockerfile at `dockerfile` inside
    /// `context`, tagged `target`.
    ///
    /// # Errors
    ///
    /// Returns an error if the target reference is invalid, the Dockerfile
    /// cannot be read, or any Dockerfile in the chain lacks a valid `FROM`.
    /// Failing to resolve a library base is not an error: that layer
    /// becomes a pull target.
    pub fn from_path(
        context: &Path,
        dockerfile: &Path,
        target: &str,
        resolver: &dyn LibrarySource,
    ) -> Result<Self> {
        Self::resolve(context, dockerfile, target, resolver, None)
    }

    /// Like [`from_path`](Self::from_path), but stops at the first base
    /// with a substitute for `arch` and rebases onto it.
    ///
    /// Upstream Dockerfiles below that base are never fetched or parsed.
    ///
    /// # Errors
    ///
    /// Same as [`from_path`](Self::from_path), plus an invalid substitute.
    pub fn for_arch(
        context: &Path,
        dockerfile: &Path,
        target: &str,
        resolver: &dyn LibrarySource,
        arch: Arch,
    ) -> Result<Self> {
        Self::resolve(context, dockerfile, target, resolver, Some(arch))
    }

    fn resolve(
        context: &Path,
        dockerfile: &Path,
        target: &str,
        resolver: &dyn LibrarySource,
        arch: Option<Arch>,
    ) -> Result<Self> {
        let reference = ImageReference::parse(target)?;
        let path = if dockerfile.is_absolute() {
            dockerfile.to_path_buf()
        } else {
            context.join(dockerfile)
        };
        let source = std::fs::read_to_string(&path).map_err(|e| BerthError::io(&path, e))?;
        let mut stack = Self {
            layers: vec![Layer {
                reference,
                dockerfile: Some(Dockerfile::parse(&source)?),
                path: Some(context.to_path_buf()),
            }],
        };
        stack.expand(resolver, arch)?;
        tracing::debug!(stack = %stack, "resolved layer stack");
        Ok(stack)
    }

    /// Builds a stack from already-resolved layers.
    #[must_use]
    pub const fn from_layers(layers: Vec<Layer>) -> Self {
        Self { layers }
    }

    fn expand(&mut self, resolver: &dyn LibrarySource, arch: Option<Arch>) -> Result<()> {
        loop {
            let Some(current) = self.layers.last() else {
                return Ok(());
            };
            let Some(dockerfile) = current.dockerfile.as_ref() else {
                return Ok(());
            };
            if current.reference.is_scratch() {
                return Ok(());
            }
            if self.layers.len() > MAX_DEPTH {
                return Err(BerthError::parse(format!(
                    "FROM chain of {} is deeper than {MAX_DEPTH} layers",
                    self.layers[0].reference
                )));
            }

            let from = dockerfile.first_from()?;
            let base = ImageReference::parse(&from.image)?;
            self.layers.push(Layer::pull_target(base.clone()));
            if base.is_scratch() {
                return Ok(());
            }
            if let Some(arch) = arch {
                if let Some(substitute) = arch.compatible_base_image(base.name()) {
                    let _ = self.rebase_at(self.layers.len() - 1, &substitute, arch)?;
                    return Ok(());
                }
            }

            let base = base.with_default_tag();
            if base.library_name().is_none() {
                tracing::debug!(image = %base, "not a library image, cannot locate its source");
                return Ok(());
            }
            let dir = match resolver.library_source(&base) {
                Ok(dir) => dir,
                Err(e) => {
                    tracing::warn!(image = %base, error = %e, "cannot resolve library source");
                    return Ok(());
                }
            };
            let df_path = dir.join(berth_common::constants::DEFAULT_DOCKERFILE);
            let parsed = std::fs::read_to_string(&df_path)
                .map_err(|e| BerthError::io(&df_path, e))
                .and_then(|text| Dockerfile::parse(&text));
            match parsed {
                Ok(parsed) => {
                    if let Some(layer) = self.layers.last_mut() {
                        layer.dockerfile = Some(parsed);
                        layer.path = Some(dir);
                    }
                }
                Err(e) => {
                    tracing::warn!(image = %base, error = %e, "cannot use library Dockerfile");
                    return Ok(());
                }
            }
        }
    }

    /// Returns the layers, target first.
    #[must_use]
    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    /// Swaps the shallowest base that has an architecture-compatible
    /// substitute for that substitute and drops everything below it.
    ///
    /// The target layer itself is never replaced. The substitute keeps the
    /// original tag and becomes a pull target; the layer above it gets a new
    /// Dockerfile text whose `FROM` names the substitute. A base that is its
    /// own substitute keeps its reference and the layer above is left as
    /// written. Returns whether the stack changed.
    ///
    /// # Errors
    ///
    /// Returns an error if the substitute reference or the rewritten
    /// Dockerfile is invalid.
    pub fn rebase_on_arch(&mut self, arch: Arch) -> Result<bool> {
        let found = self.layers.iter().enumerate().skip(1).find_map(|(i, layer)| {
            if layer.reference.is_scratch() {
                return None;
            }
            arch.compatible_base_image(layer.reference.name())
                .map(|substitute| (i, substitute))
        });
        match found {
            Some((index, substitute)) => self.rebase_at(index, &substitute, arch),
            None => Ok(false),
        }
    }

    fn rebase_at(&mut self, index: usize, substitute: &str, arch: Arch) -> Result<bool> {
        let original = self.layers[index].reference.clone();
        let rebased = original.rebased_onto(substitute)?;
        let changed = self.layers.len() > index + 1
            || self.layers[index].dockerfile.is_some()
            || rebased != original;
        self.layers.truncate(index + 1);
        self.layers[index] = Layer::pull_target(rebased.clone());
        if rebased == original {
            tracing::debug!(image = %original, arch = %arch, "base already runs on target");
            return Ok(changed);
        }

        tracing::debug!(from = %original, to = %rebased, arch = %arch, "rebasing layer stack");
        let above = &mut self.layers[index - 1];
        if let Some(dockerfile) = above.dockerfile.as_ref() {
            let text = dockerfile.rewrite_from(&rebased.to_string())?;
            above.dockerfile = Some(Dockerfile::parse(&text)?);
        }
        Ok(changed)
    }

    /// Checks that every layer above the bottom one can be built.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first layer with no known Dockerfile.
    pub fn ensure_buildable(&self) -> Result<()> {
        let above_bottom = self.layers.len().saturating_sub(1);
        for layer in &self.layers[..above_bottom] {
            if layer.dockerfile.is_none() || layer.path.is_none() {
                return Err(BerthError::Build {
                    reference: layer.reference.to_string(),
                    message: "source of this layer is unknown".into(),
                });
            }
        }
        Ok(())
    }

    /// Returns the bottom layer, the one to pull before building.
    #[must_use]
    pub fn bottom(&self) -> Option<&Layer> {
        self.layers.last()
    }

    /// Returns the layers to build, deepest first.
    pub fn build_order(&self) -> impl Iterator<Item = &Layer> {
        let above_bottom = self.layers.len().saturating_sub(1);
        self.layers[..above_bottom].iter().rev()
    }
}

impl fmt::Display for ImageStack {
    /// Formats the stack as `ref [pull] ref ...` for logs.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, layer) in self.layers.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{}", layer.reference)?;
            if layer.is_pull_target() {
                f.write_str(" [pull]")?;
            }
        }
        Ok(())
    }
}
