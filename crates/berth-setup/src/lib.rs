//! # berth-setup
//!
//! Converges declared images, containers, and host users.
//!
//! Handles:
//! - **Jobs**: one-shot completion signals and the concurrent runner.
//! - **Images**: pull policies with build fallback.
//! - **Containers**: lookup by name, creation once the image is ready.
//! - **Users**: host accounts, credentials, SSH keys, shell descriptors.
//! - **Setup**: wires every job to the waiters it depends on.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod container;
pub mod host;
pub mod image;
pub mod job;
pub mod password;
pub mod setup;
pub mod user;
pub mod waiter;

pub use setup::Setup;
