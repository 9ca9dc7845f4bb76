//! `berth defconfig` — write the stock configuration.

use std::path::Path;

use berth_common::config::Config;

/// Executes the `defconfig` command. Never overwrites an existing file.
///
/// # Errors
///
/// Returns an error if `path` exists or cannot be written.
pub fn execute(path: &Path) -> anyhow::Result<()> {
    if path.exists() {
        anyhow::bail!("{} already exists, not overwriting", path.display());
    }
    Config::default_config().save(path)?;
    tracing::info!(path = %path.display(), "wrote default config");
    Ok(())
}
