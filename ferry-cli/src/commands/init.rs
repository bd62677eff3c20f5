//! `ferry init --project <name> --dest <dir> --node <n>... --share <s>...`

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Args;

use ferry_core::config::{self, DEFAULT_IDLE_TIMEOUT_MINUTES, DEFAULT_MAX_PARALLELISM};
use ferry_core::{NodeName, ShareName, SyncConfig};

#[derive(Args, Debug)]
pub struct InitArgs {
    /// Project directory name looked up under every share.
    #[arg(long, short = 'p')]
    pub project: String,

    /// Destination root; files land under <dest>/<project>.
    #[arg(long, short = 'd')]
    pub dest: PathBuf,

    /// Acquisition node name. Repeat for each node.
    #[arg(long = "node", short = 'n', required = true)]
    pub nodes: Vec<String>,

    /// Share name present on every node. Repeat for each share.
    #[arg(long = "share", short = 's', required = true)]
    pub shares: Vec<String>,

    #[arg(long, default_value_t = DEFAULT_IDLE_TIMEOUT_MINUTES)]
    pub idle_timeout_minutes: u64,

    /// Concurrent file copies per source.
    #[arg(long, default_value_t = DEFAULT_MAX_PARALLELISM)]
    pub threads: usize,

    /// Share root pattern with {node} and {share} placeholders.
    #[arg(long)]
    pub source_template: Option<String>,

    #[arg(long)]
    pub poll_interval_secs: Option<u64>,

    /// Free space to keep on the destination beyond each transfer.
    #[arg(long)]
    pub safety_margin_mb: Option<u64>,

    /// Abort running transfers when free space falls below this.
    #[arg(long)]
    pub hard_floor_mb: Option<u64>,

    /// Sources that must deliver a capture before it counts as complete.
    #[arg(long)]
    pub expected_sources: Option<usize>,

    /// Overwrite an existing config.
    #[arg(long)]
    pub force: bool,
}

impl InitArgs {
    pub fn run(self) -> Result<()> {
        let home = dirs::home_dir().context("could not determine home directory")?;
        let path = config::config_path_at(&home);
        if path.exists() && !self.force {
            bail!(
                "config already exists at {} (use --force to overwrite)",
                path.display()
            );
        }

        let mut cfg = SyncConfig::new(
            self.project.as_str(),
            self.dest,
            self.nodes.into_iter().map(NodeName::from).collect(),
            self.shares.into_iter().map(ShareName::from).collect(),
        );
        cfg.idle_timeout_minutes = self.idle_timeout_minutes;
        cfg.max_parallelism = self.threads;
        if let Some(template) = self.source_template {
            cfg.source_template = template;
        }
        if let Some(secs) = self.poll_interval_secs {
            cfg.poll_interval_secs = secs;
        }
        if let Some(mb) = self.safety_margin_mb {
            cfg.safety_margin_mb = mb;
        }
        if let Some(mb) = self.hard_floor_mb {
            cfg.hard_floor_mb = mb;
        }
        cfg.expected_sources = self.expected_sources;

        let saved = config::save_at(&home, &cfg).context("failed to write config")?;
        println!(
            "✓ Configured project '{}' with {} sources",
            cfg.project_name,
            cfg.registered_sources()
        );
        println!("  Saved to: {}", saved.display());
        Ok(())
    }
}
