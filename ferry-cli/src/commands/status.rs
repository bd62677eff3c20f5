//! `ferry status`: live per-source snapshot from the daemon.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::Args;
use colored::Colorize;
use tabled::{settings::Style, Table, Tabled};

use ferry_core::{TaskState, TaskStatus};
use ferry_daemon::{request_snapshot, DaemonError};

#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Tabled)]
struct StatusRow {
    #[tabled(rename = "source")]
    source: String,
    #[tabled(rename = "state")]
    state: String,
    #[tabled(rename = "files")]
    files: u64,
    #[tabled(rename = "copied")]
    copied: String,
    #[tabled(rename = "failed")]
    failed: u64,
    #[tabled(rename = "progress")]
    progress: String,
    #[tabled(rename = "last activity")]
    last_activity: String,
    #[tabled(rename = "detail")]
    detail: String,
}

impl StatusArgs {
    pub fn run(self) -> Result<()> {
        let home = dirs::home_dir().context("could not determine home directory")?;
        let rows = match request_snapshot(&home) {
            Ok(rows) => rows,
            Err(DaemonError::DaemonNotRunning { .. }) => {
                if self.json {
                    println!("{}", serde_json::json!({ "running": false }));
                } else {
                    println!("daemon is not running; start it with `ferry daemon start`");
                }
                return Ok(());
            }
            Err(err) => return Err(err).context("failed to query daemon snapshot"),
        };

        if self.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&rows).context("failed to serialize status JSON")?
            );
            return Ok(());
        }
        print_table(&rows, Utc::now());
        Ok(())
    }
}

fn print_table(rows: &[TaskStatus], now: DateTime<Utc>) {
    let active = rows
        .iter()
        .filter(|r| r.state.map_or(false, |s| !s.is_terminal()))
        .count();
    println!(
        "Ferry v{} | {} sources | {} active",
        env!("CARGO_PKG_VERSION"),
        rows.len(),
        active
    );

    let table_rows: Vec<StatusRow> = rows
        .iter()
        .map(|row| StatusRow {
            source: format!("{}/{}", row.node, row.share),
            state: state_label(row.state),
            files: row.files_copied,
            copied: human_bytes(row.bytes_copied),
            failed: row.files_failed,
            progress: row
                .progress_percent
                .map(|p| format!("{p}%"))
                .unwrap_or_else(|| "-".to_string()),
            last_activity: row
                .last_activity
                .map(|at| format_age(now, at))
                .unwrap_or_else(|| "never".to_string()),
            detail: row.detail.clone().unwrap_or_default(),
        })
        .collect();
    let mut table = Table::new(table_rows);
    table.with(Style::rounded());
    println!("{table}");
}

fn state_label(state: Option<TaskState>) -> String {
    match state {
        None => "idle".bright_black().to_string(),
        Some(s @ (TaskState::Pending | TaskState::Scanning)) => s.to_string().cyan().to_string(),
        Some(s @ TaskState::Copying) => s.to_string().blue().bold().to_string(),
        Some(s @ TaskState::Completed) => s.to_string().green().to_string(),
        Some(s @ TaskState::IdleStopped) => s.to_string().yellow().to_string(),
        Some(s @ TaskState::Failed) => s.to_string().red().bold().to_string(),
    }
}

fn format_age(now: DateTime<Utc>, at: DateTime<Utc>) -> String {
    let secs = (now - at).num_seconds().max(0);
    match secs {
        0..=59 => format!("{secs}s ago"),
        60..=3599 => format!("{}m ago", secs / 60),
        3600..=86_399 => format!("{}h ago", secs / 3600),
        _ => format!("{}d ago", secs / 86_400),
    }
}

fn human_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit + 1 < UNITS.len() {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn ages_use_coarsest_unit() {
        let now = Utc::now();
        assert_eq!(format_age(now, now - Duration::seconds(5)), "5s ago");
        assert_eq!(format_age(now, now - Duration::minutes(3)), "3m ago");
        assert_eq!(format_age(now, now - Duration::hours(2)), "2h ago");
        assert_eq!(format_age(now, now + Duration::seconds(9)), "0s ago");
    }

    #[test]
    fn byte_counts_are_humanized() {
        assert_eq!(human_bytes(512), "512 B");
        assert_eq!(human_bytes(1536), "1.5 KiB");
        assert_eq!(human_bytes(3 * 1024 * 1024 * 1024), "3.0 GiB");
    }
}
