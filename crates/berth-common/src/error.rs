//! Unified error types for the berth workspace.
//!
//! Setup jobs hand the same failure to every waiter, so job outcomes carry
//! errors as [`SharedError`] rather than owning them.

use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

/// Top-level error type shared across the workspace.
#[derive(Debug, Error)]
pub enum BerthError {
    /// An I/O operation failed.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// Path where the I/O error occurred.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// A configuration value is invalid or a reference does not resolve.
    #[error("invalid configuration: {message}")]
    Config {
        /// Description of the invalid configuration.
        message: String,
    },

    /// A required resource was not found.
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Type of the missing resource.
        kind: &'static str,
        /// Identifier of the missing resource.
        id: String,
    },

    /// A permission or privilege error.
    #[error("permission denied: {message}")]
    PermissionDenied {
        /// Description of the denied operation.
        message: String,
    },

    /// JSON serialization or deserialization failed.
    #[error("serialization error: {source}")]
    Serialization {
        /// Underlying serialization error.
        #[from]
        source: serde_json::Error,
    },

    /// YAML serialization or deserialization failed.
    #[error("YAML error: {source}")]
    Yaml {
        /// Underlying YAML error.
        #[from]
        source: serde_yaml::Error,
    },

    /// The container runtime rejected or failed a request.
    #[error("container runtime error: {message}")]
    Runtime {
        /// Description reported by the runtime.
        message: String,
    },

    /// Pulling an image failed.
    #[error("cannot pull {reference}: {message}")]
    Pull {
        /// Reference that was being pulled.
        reference: String,
        /// Failure reported by the runtime.
        message: String,
    },

    /// Building an image failed.
    #[error("cannot build {reference}: {message}")]
    Build {
        /// Tag that was being built.
        reference: String,
        /// Failure description.
        message: String,
    },

    /// A Dockerfile, manifest, or image reference could not be parsed.
    #[error("parse error: {message}")]
    Parse {
        /// Description of the malformed input.
        message: String,
    },

    /// An archive entry tried to escape its destination directory.
    #[error("archive entry escapes destination: {entry}")]
    PathTraversal {
        /// Offending entry name.
        entry: String,
    },

    /// An external command exited unsuccessfully.
    #[error("command `{command}` failed: {message}")]
    Command {
        /// Command line that was run.
        command: String,
        /// Exit status or captured stderr.
        message: String,
    },
}

impl BerthError {
    /// Builds an [`BerthError::Io`] for the given path.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Builds a [`BerthError::Config`] from a message.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Builds a [`BerthError::Runtime`] from any displayable failure.
    pub fn runtime(message: impl std::fmt::Display) -> Self {
        Self::Runtime {
            message: message.to_string(),
        }
    }

    /// Builds a [`BerthError::Parse`] from a message.
    pub fn parse(message: impl Into<String>) -> Self {
        Self::Parse {
            message: message.into(),
        }
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, BerthError>;

/// An error shared between a job and every caller waiting on it.
pub type SharedError = Arc<BerthError>;

/// Outcome of a setup job, observable by any number of waiters.
pub type JobResult<T> = std::result::Result<T, SharedError>;
