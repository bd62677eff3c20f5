pub mod daemon;
pub mod init;
pub mod scan;
pub mod sources;
pub mod status;

use anyhow::{Context, Result};
use ferry_core::{config, SyncConfig};

/// Load `~/.ferry/config.yaml`, pointing at `ferry init` when it is missing.
pub(crate) fn load_config() -> Result<SyncConfig> {
    config::load().context("failed to load config; run `ferry init` first")
}
