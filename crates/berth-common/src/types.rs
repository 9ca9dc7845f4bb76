//! Domain primitive types used across the berth workspace.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier the container runtime assigned to a container.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContainerId(String);

impl ContainerId {
    /// Creates a new container ID from a string value.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the inner string representation.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Container name with the runtime's leading `/` stripped.
///
/// The runtime reports names as `/core`, configuration uses `core`; both
/// compare equal once wrapped.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContainerName(String);

impl ContainerName {
    /// Normalizes a configured or runtime-reported container name.
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self(name.trim_start_matches('/').to_string())
    }

    /// Returns the bare name, without a leading `/`.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the name in the runtime's `/name` form.
    #[must_use]
    pub fn runtime_form(&self) -> String {
        format!("/{}", self.0)
    }
}

impl fmt::Display for ContainerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn container_name_strips_leading_slash() {
        assert_eq!(ContainerName::new("/core"), ContainerName::new("core"));
        assert_eq!(ContainerName::new("/core").as_str(), "core");
    }

    #[test]
    fn container_name_runtime_form_has_single_slash() {
        assert_eq!(ContainerName::new("core").runtime_form(), "/core");
        assert_eq!(ContainerName::new("//core").runtime_form(), "/core");
    }

    #[test]
    fn container_id_displays_inner_value() {
        let id = ContainerId::new("abc123");
        assert_eq!(id.to_string(), "abc123");
        assert_eq!(id.as_str(), "abc123");
    }
}
