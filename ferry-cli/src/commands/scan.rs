//! `ferry scan <node> <share>`: dry-run diff for one source.

use anyhow::{bail, Context, Result};
use clap::Args;
use serde::Serialize;

use ferry_core::{SourceKey, SourceRegistry};
use ferry_sync::{scan, FileRecord};

use super::load_config;

#[derive(Args, Debug)]
pub struct ScanArgs {
    pub node: String,
    pub share: String,

    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Serialize)]
struct ScanJson {
    source: String,
    root: String,
    destination: String,
    files: Vec<FileJson>,
    total_bytes: u64,
}

#[derive(Serialize)]
struct FileJson {
    path: String,
    size: u64,
}

impl ScanArgs {
    pub fn run(self) -> Result<()> {
        let cfg = load_config()?;
        let registry = SourceRegistry::from_config(&cfg);
        let project = &cfg.project_name;
        let key = SourceKey::new(self.node.as_str(), self.share.as_str());

        if !registry.discover(project).contains(&key) {
            bail!("source '{key}' is not registered; see `ferry sources`");
        }
        let Some(root) = registry.resolve(&key, project) else {
            bail!(
                "source '{key}' is not available at {}",
                registry.root_path(&key, project).display()
            );
        };
        let destination = cfg.destination_root.join(&project.0);

        let records: Vec<FileRecord> = scan(&root.path, &destination)
            .collect::<Result<_, _>>()
            .with_context(|| format!("scan of {} failed", root.path.display()))?;
        let total_bytes: u64 = records.iter().map(|r| r.size).sum();

        if self.json {
            let payload = ScanJson {
                source: key.to_string(),
                root: root.path.display().to_string(),
                destination: destination.display().to_string(),
                files: records
                    .iter()
                    .map(|r| FileJson {
                        path: r.relative_path.display().to_string(),
                        size: r.size,
                    })
                    .collect(),
                total_bytes,
            };
            println!(
                "{}",
                serde_json::to_string_pretty(&payload).context("failed to serialize scan JSON")?
            );
            return Ok(());
        }

        if records.is_empty() {
            println!("{key}: destination is up to date");
            return Ok(());
        }
        for record in &records {
            println!("  would copy {} ({} bytes)", record.relative_path.display(), record.size);
        }
        println!("{key}: {} files, {total_bytes} bytes due", records.len());
        Ok(())
    }
}
