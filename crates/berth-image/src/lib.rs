//! # berth-image
//!
//! Image build pipeline for berth.
//!
//! Handles:
//! - **Sources**: git clones, `.tar.gz` archives, and local directories.
//! - **Contexts**: tarred build contexts honoring `.dockerignore`.
//! - **Dockerfiles**: line-accurate instruction parsing and `FROM` rewriting.
//! - **Stacks**: `FROM` chains resolved through the official image library.
//! - **Arch**: host classification and compatible base-image substitution.
//! - **Builder**: direct builds and layer-by-layer scratch builds.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod arch;
pub mod builder;
pub mod context;
pub mod dockerfile;
pub mod library;
pub mod reference;
pub mod source;
pub mod stack;
