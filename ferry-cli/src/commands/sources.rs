//! `ferry sources`: the registered source universe and what resolves now.

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use serde::Serialize;
use tabled::{settings::Style, Table, Tabled};

use ferry_core::SourceRegistry;

use super::load_config;

#[derive(Args, Debug)]
pub struct SourcesArgs {
    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Serialize)]
struct SourceJson {
    node: String,
    share: String,
    path: String,
    available: bool,
}

#[derive(Tabled)]
struct SourceRow {
    #[tabled(rename = "source")]
    source: String,
    #[tabled(rename = "available")]
    available: String,
    #[tabled(rename = "path")]
    path: String,
}

impl SourcesArgs {
    pub fn run(self) -> Result<()> {
        let cfg = load_config()?;
        let registry = SourceRegistry::from_config(&cfg);
        let project = &cfg.project_name;

        let sources: Vec<SourceJson> = registry
            .discover(project)
            .into_iter()
            .map(|key| SourceJson {
                path: registry.root_path(&key, project).display().to_string(),
                available: registry.resolve(&key, project).is_some(),
                node: key.node.0,
                share: key.share.0,
            })
            .collect();

        if self.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&sources).context("failed to serialize sources")?
            );
            return Ok(());
        }

        let online = sources.iter().filter(|s| s.available).count();
        println!(
            "Project {} | {} registered | {} available",
            project.0.bold(),
            sources.len(),
            online
        );
        let rows: Vec<SourceRow> = sources
            .into_iter()
            .map(|s| SourceRow {
                source: format!("{}/{}", s.node, s.share),
                available: if s.available {
                    "yes".green().to_string()
                } else {
                    "no".bright_black().to_string()
                },
                path: s.path,
            })
            .collect();
        let mut table = Table::new(rows);
        table.with(Style::rounded());
        println!("{table}");
        Ok(())
    }
}
