//! `berth setup` — converge images, containers, and users.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use berth_common::config::Config;
use berth_image::arch::Arch;
use berth_image::builder::Builder;
use berth_runtime::docker::DockerRuntime;
use berth_setup::Setup;
use berth_setup::host::SystemAccounts;
use clap::Args;

/// Arguments for the `setup` command.
#[derive(Args, Debug)]
pub struct SetupArgs {
    /// Create host users that do not exist yet.
    #[arg(long)]
    pub create_users: bool,

    /// Target architecture for scratch builds (defaults to the host).
    #[arg(long)]
    pub arch: Option<String>,
}

/// Executes the `setup` command.
///
/// # Errors
///
/// Returns an error if the config cannot be loaded, the runtime is
/// unreachable, or any setup job fails.
pub fn execute(config_path: &Path, args: &SetupArgs) -> anyhow::Result<()> {
    let config = Config::load(config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    let arch = args.arch.as_deref().map(Arch::from_name).transpose()?;
    tracing::info!(
        config = %config_path.display(),
        images = config.images.len(),
        containers = config.containers.len(),
        users = config.users.len(),
        arch = ?arch,
        "running setup"
    );

    let tokio = tokio::runtime::Runtime::new().context("starting async runtime")?;
    tokio.block_on(async {
        let runtime = Arc::new(DockerRuntime::connect()?);
        let mut builder = Builder::new(runtime.clone());
        if let Some(arch) = arch {
            builder = builder.with_arch(arch);
        }
        let builder = Arc::new(builder);
        let setup = Setup::new(
            &config,
            args.create_users,
            runtime,
            builder,
            Arc::new(SystemAccounts),
        );
        setup
            .execute()
            .await
            .map_err(|e| anyhow::anyhow!("setup failed: {e}"))
    })
}
