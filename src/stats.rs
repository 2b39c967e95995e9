//! Ledger overview.
//!
//! Summarises every ledger under the output root: rows written, distinct
//! sections, how many of those currently stand failed, and whether the
//! merged volume record exists. Used by `vx status` to judge whether a
//! `--retry-failed` pass is worth running.

use anyhow::Result;
use std::path::Path;

use crate::config::Config;
use crate::ledger::{find_ledgers, LedgerSummary, VolumePaths};

/// One row of the status table.
struct VolumeStatus {
    name: String,
    summary: LedgerSummary,
    merged: bool,
}

/// Run the status command: read every ledger and print a summary.
pub fn run_status(config: &Config) -> Result<()> {
    let root = &config.output.root;
    let ledgers = find_ledgers(root)?;

    let mut volumes = Vec::with_capacity(ledgers.len());
    for path in &ledgers {
        volumes.push(VolumeStatus {
            name: display_name(path),
            summary: LedgerSummary::read(path)?,
            merged: VolumePaths::record_for_ledger(path)
                .map(|p| p.exists())
                .unwrap_or(false),
        });
    }

    let total_sections: usize = volumes.iter().map(|v| v.summary.sections).sum();
    let total_failed: usize = volumes.iter().map(|v| v.summary.failed).sum();
    let total_malformed: usize = volumes.iter().map(|v| v.summary.malformed).sum();

    println!("Volume Extract: Ledger Status");
    println!("=============================");
    println!();
    println!("  Output:      {}", root.display());
    println!("  Ledgers:     {}", volumes.len());
    println!(
        "  Sections:    {} ({} failed)",
        total_sections, total_failed
    );
    if total_malformed > 0 {
        println!("  Malformed:   {} lines skipped", total_malformed);
    }

    if !volumes.is_empty() {
        println!();
        println!(
            "  {:<32} {:>6} {:>9} {:>7} {:>7}   {}",
            "VOLUME", "ROWS", "SECTIONS", "FAILED", "MERGED", "LAST WRITE"
        );
        println!("  {}", "-".repeat(84));

        for v in &volumes {
            let last = match v.summary.last_written {
                Some(ts) => format_ts_relative(ts.timestamp()),
                None => "never".to_string(),
            };
            println!(
                "  {:<32} {:>6} {:>9} {:>7} {:>7}   {}",
                v.name,
                v.summary.rows,
                v.summary.sections,
                v.summary.failed,
                if v.merged { "yes" } else { "no" },
                last
            );
        }
    }

    println!();
    Ok(())
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .and_then(|n| {
            n.strip_suffix(crate::ledger::LEDGER_SUFFIX)
                .map(str::to_string)
        })
        .unwrap_or_else(|| path.display().to_string())
}

/// Format a Unix timestamp as a relative time string (e.g. "3 hours ago").
fn format_ts_relative(ts: i64) -> String {
    let now = chrono::Utc::now().timestamp();
    let delta = now - ts;

    if delta < 0 {
        return format_ts_iso(ts);
    }

    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        format_ts_iso(ts)
    }
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_name_strips_suffix() {
        let p = std::path::PathBuf::from("/out/資治通鑑/資治通鑑_卷199.sections.extractions.jsonl");
        assert_eq!(display_name(&p), "資治通鑑_卷199");
    }

    #[test]
    fn test_relative_time() {
        let now = chrono::Utc::now().timestamp();
        assert_eq!(format_ts_relative(now), "just now");
        assert_eq!(format_ts_relative(now - 7200), "2 hours ago");
        assert_eq!(format_ts_relative(now - 60), "1 min ago");
    }
}
