//! CLI command definitions and dispatch.

pub mod defconfig;
pub mod setup;
pub mod sysinfo;

use std::path::PathBuf;

use berth_common::constants::{CONFIG_PATH_ENV, DEFAULT_CONFIG_PATH};
use clap::{Parser, Subcommand};

/// berth — provision containers and the users that live in them.
#[derive(Parser, Debug)]
#[command(name = "berth", version, about, long_about = None)]
pub struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Command,

    /// Path to the configuration file.
    #[arg(long, short, global = true, env = CONFIG_PATH_ENV, default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    /// Log at debug level unless `RUST_LOG` says otherwise.
    #[arg(long, short, global = true)]
    pub verbose: bool,
}

/// Available CLI subcommands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Set up images, containers, and users.
    Setup(setup::SetupArgs),
    /// Write the default configuration.
    Defconfig,
    /// Print detected system information.
    Sysinfo,
}

/// Dispatches the parsed CLI command to its handler.
///
/// # Errors
///
/// Returns an error if the command execution fails.
pub fn execute(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Command::Setup(args) => setup::execute(&cli.config, &args),
        Command::Defconfig => defconfig::execute(&cli.config),
        Command::Sysinfo => {
            sysinfo::execute();
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn setup_flags_parse() {
        let cli = Cli::try_parse_from([
            "berth",
            "--config",
            "/tmp/berth.yaml",
            "setup",
            "--create-users",
            "--arch",
            "arm",
        ])
        .expect("parse");
        assert_eq!(cli.config, PathBuf::from("/tmp/berth.yaml"));
        let Command::Setup(args) = cli.command else {
            panic!("expected setup");
        };
        assert!(args.create_users);
        assert_eq!(args.arch.as_deref(), Some("arm"));
    }
}
