//! Image reference parsing and normalization.

use std::fmt;

use berth_common::constants::{DEFAULT_REGISTRY, DEFAULT_TAG, SCRATCH_IMAGE};
use berth_common::error::{BerthError, Result};

const LIBRARY_PREFIX: &str = "library/";

/// A parsed image reference.
///
/// Names are normalized for lookups: the default registry host is dropped
/// and single-component names gain the `library/` namespace, so `alpine`,
/// `library/alpine`, and `docker.io/library/alpine` compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageReference {
    name: String,
    tag: Option<String>,
    digest: Option<String>,
}

fn valid_component(component: &str) -> bool {
    !component.is_empty()
        && component
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '_' | '-'))
}

fn valid_registry(host: &str) -> bool {
    let (hostname, port) = host.split_once(':').unwrap_or((host, ""));
    !hostname.is_empty()
        && hostname
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-'))
        && port.chars().all(|c| c.is_ascii_digit())
}

fn looks_like_registry(component: &str) -> bool {
    component.contains('.') || component.contains(':') || component == "localhost"
}

fn valid_tag(tag: &str) -> bool {
    !tag.is_empty()
        && tag.len() <= 128
        && tag
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
}

impl ImageReference {
    /// Parses and normalizes a reference such as `alpine:3.10`.
    ///
    /// # Errors
    ///
    /// Returns [`BerthError::Parse`] when the reference is malformed.
    pub fn parse(input: &str) -> Result<Self> {
        let input = input.trim();
        let malformed = |why: &str| BerthError::parse(format!("invalid image reference {input:?}: {why}"));
        if input.is_empty() {
            return Err(malformed("empty"));
        }

        let (rest, digest) = match input.split_once('@') {
            Some((rest, digest)) if !digest.is_empty() => (rest, Some(digest.to_string())),
            Some(_) => return Err(malformed("empty digest")),
            None => (input, None),
        };

        let last_slash = rest.rfind('/').map_or(0, |i| i + 1);
        let (name, tag) = match rest[last_slash..].rfind(':') {
            Some(i) => {
                let split = last_slash + i;
                (&rest[..split], Some(rest[split + 1..].to_string()))
            }
            None => (rest, None),
        };

        if tag.as_deref().is_some_and(|t| !valid_tag(t)) {
            return Err(malformed("bad tag"));
        }

        let mut components: Vec<&str> = name.split('/').collect();
        if components.len() > 1 && looks_like_registry(components[0]) {
            if !valid_registry(components[0]) {
                return Err(malformed("bad registry host"));
            }
            if components[0] == DEFAULT_REGISTRY || components[0] == "index.docker.io" {
                let _ = components.remove(0);
            }
        }
        let start = usize::from(components.len() > 1 && looks_like_registry(components[0]));
        if components[start..].iter().any(|c| !valid_component(c)) {
            return Err(malformed("bad repository name"));
        }

        let mut name = components.join("/");
        if !name.contains('/') && name != SCRATCH_IMAGE {
            name = format!("{LIBRARY_PREFIX}{name}");
        }
        Ok(Self { name, tag, digest })
    }

    /// Returns the normalized repository name, without tag.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the explicit tag, if any.
    #[must_use]
    pub fn explicit_tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    /// Returns the tag, defaulting to `latest`.
    #[must_use]
    pub fn tag(&self) -> &str {
        self.tag.as_deref().unwrap_or(DEFAULT_TAG)
    }

    /// Returns whether this is the `scratch` pseudo-image.
    #[must_use]
    pub fn is_scratch(&self) -> bool {
        self.name == SCRATCH_IMAGE
    }

    /// Returns the bare library name for official images, e.g. `alpine`.
    #[must_use]
    pub fn library_name(&self) -> Option<&str> {
        self.name.strip_prefix(LIBRARY_PREFIX)
    }

    /// Returns a copy with an explicit tag, defaulting to `latest`.
    #[must_use]
    pub fn with_default_tag(&self) -> Self {
        Self {
            tag: Some(self.tag().to_string()),
            ..self.clone()
        }
    }

    /// Returns `substitute` carrying this reference's tag.
    ///
    /// A substitute naming this same repository returns the reference
    /// unchanged, digest included. A digest never carries over to another
    /// repository.
    ///
    /// # Errors
    ///
    /// Returns an error if `substitute` is not a valid repository name.
    pub fn rebased_onto(&self, substitute: &str) -> Result<Self> {
        let base = Self::parse(substitute)?;
        if base.name == self.name {
            return Ok(self.clone());
        }
        Ok(Self {
            name: base.name,
            tag: Some(self.tag().to_string()),
            digest: None,
        })
    }
}

impl fmt::Display for ImageReference {
    /// Formats the reference in the short form the runtime accepts.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = self.library_name().unwrap_or(&self.name);
        f.write_str(name)?;
        if let Some(tag) = &self.tag {
            write!(f, ":{tag}")?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{digest}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_name_gains_library_namespace() {
        let r = ImageReference::parse("alpine:3.10").expect("parse");
        assert_eq!(r.name(), "library/alpine");
        assert_eq!(r.tag(), "3.10");
        assert_eq!(r.library_name(), Some("alpine"));
        assert_eq!(r.to_string(), "alpine:3.10");
    }

    #[test]
    fn default_registry_is_stripped() {
        let a = ImageReference::parse("docker.io/library/debian").expect("parse");
        let b = ImageReference::parse("debian").expect("parse");
        assert_eq!(a, b);
        assert_eq!(a.tag(), "latest");
        assert_eq!(a.explicit_tag(), None);
    }

    #[test]
    fn custom_registry_with_port_is_kept() {
        let r = ImageReference::parse("registry.local:5000/team/app:v2").expect("parse");
        assert_eq!(r.name(), "registry.local:5000/team/app");
        assert_eq!(r.tag(), "v2");
        assert_eq!(r.library_name(), None);
    }

    #[test]
    fn scratch_stays_bare() {
        let r = ImageReference::parse("scratch").expect("parse");
        assert!(r.is_scratch());
        assert_eq!(r.name(), "scratch");
    }

    #[test]
    fn digest_is_preserved() {
        let r = ImageReference::parse("alpine@sha256:abcd").expect("parse");
        assert_eq!(r.to_string(), "alpine@sha256:abcd");
    }

    #[test]
    fn malformed_references_are_rejected() {
        assert!(ImageReference::parse("").is_err());
        assert!(ImageReference::parse("Alpine").is_err());
        assert!(ImageReference::parse("alpine:").is_err());
        assert!(ImageReference::parse("a//b").is_err());
    }

    #[test]
    fn rebase_keeps_tag() {
        let r = ImageReference::parse("library/alpine:3.10").expect("parse");
        let rebased = r.rebased_onto("container4armhf/armhf-alpine").expect("rebase");
        assert_eq!(rebased.to_string(), "container4armhf/armhf-alpine:3.10");

        let untagged = ImageReference::parse("ubuntu").expect("parse");
        let rebased = untagged.rebased_onto("ioft/armhf-ubuntu").expect("rebase");
        assert_eq!(rebased.to_string(), "ioft/armhf-ubuntu:latest");
    }

    #[test]
    fn rebase_onto_same_repository_keeps_digest() {
        let pinned = ImageReference::parse("alpine@sha256:abcd").expect("parse");
        let rebased = pinned.rebased_onto("library/alpine").expect("rebase");
        assert_eq!(rebased, pinned);
        assert_eq!(rebased.to_string(), "alpine@sha256:abcd");

        let ported = pinned.rebased_onto("container4armhf/armhf-alpine").expect("rebase");
        assert_eq!(ported.to_string(), "container4armhf/armhf-alpine:latest");
    }
}
