//! Container runtime access for berth.
//!
//! [`RuntimeClient`](client::RuntimeClient) is the seam between setup jobs and
//! the container engine. [`DockerRuntime`](docker::DockerRuntime) talks to a
//! Docker-compatible daemon. The `mock` feature adds an in-memory runtime
//! for tests.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod client;
pub mod docker;
pub mod exec;
pub mod fanout;
pub mod logs;
#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use client::RuntimeClient;
pub use fanout::FanOut;
