//! Section-completion ledger.
//!
//! The ledger is an append-only JSONL file of [`SectionOutcome`] rows, one
//! per dispatched section. It is the only durable record of completed work:
//! on resume it decides which sections are already done, and the volume
//! merge can be rebuilt from it alone.
//!
//! Reading is a fold over the file. Lines that fail to parse are skipped,
//! so a torn final line after a crash never blocks a resume. Nothing is
//! ever rewritten or compacted; a section dispatched twice simply has two
//! rows and the later one wins wherever rows are folded per id.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use walkdir::WalkDir;

use crate::models::{Section, SectionOutcome, VolumeMeta};

/// Suffix of per-volume ledger files.
pub const LEDGER_SUFFIX: &str = ".sections.extractions.jsonl";
/// Suffix of per-volume merged records.
pub const RECORD_SUFFIX: &str = ".volume.json";

/// Output locations for one volume.
#[derive(Debug, Clone, PartialEq)]
pub struct VolumePaths {
    pub ledger: PathBuf,
    pub record: PathBuf,
}

impl VolumePaths {
    /// `<root>/<work>/<work>_卷<volume>{.sections.extractions.jsonl,.volume.json}`
    pub fn for_volume(out_root: &Path, meta: &VolumeMeta) -> Self {
        let dir = out_root.join(&meta.work);
        let stem = format!("{}_卷{}", meta.work, meta.volume);
        Self {
            ledger: dir.join(format!("{}{}", stem, LEDGER_SUFFIX)),
            record: dir.join(format!("{}{}", stem, RECORD_SUFFIX)),
        }
    }

    /// Record path that sits next to a ledger file.
    pub fn record_for_ledger(ledger: &Path) -> Option<PathBuf> {
        let name = ledger.file_name()?.to_str()?;
        let stem = name.strip_suffix(LEDGER_SUFFIX)?;
        Some(ledger.with_file_name(format!("{}{}", stem, RECORD_SUFFIX)))
    }
}

#[derive(Deserialize)]
struct LedgerId {
    #[serde(default)]
    section_id: Option<String>,
}

/// Rows of type `T` that parsed, plus the count of lines that did not.
fn scan_rows<T: DeserializeOwned>(path: &Path) -> Result<(Vec<T>, usize)> {
    if !path.exists() {
        return Ok((Vec::new(), 0));
    }

    let file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open ledger: {}", path.display()))?;

    let mut rows = Vec::new();
    let mut malformed = 0usize;
    for (lineno, line) in BufReader::new(file).lines().enumerate() {
        let line = match line {
            Ok(l) => l,
            Err(e) => {
                tracing::warn!(ledger = %path.display(), line = lineno + 1, error = %e, "unreadable ledger line skipped");
                malformed += 1;
                continue;
            }
        };
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        match serde_json::from_str::<T>(trimmed) {
            Ok(row) => rows.push(row),
            Err(e) => {
                tracing::warn!(ledger = %path.display(), line = lineno + 1, error = %e, "malformed ledger line skipped");
                malformed += 1;
            }
        }
    }

    Ok((rows, malformed))
}

/// Every section id with at least one row in the ledger, failed or not.
///
/// A missing ledger means nothing is done.
pub fn load_done(path: &Path) -> Result<HashSet<String>> {
    let (rows, _) = scan_rows::<LedgerId>(path)?;
    Ok(rows
        .into_iter()
        .filter_map(|r| r.section_id)
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
        .collect())
}

/// All well-formed outcome rows in file order.
pub fn load_outcomes(path: &Path) -> Result<Vec<SectionOutcome>> {
    let (rows, _) = scan_rows::<SectionOutcome>(path)?;
    Ok(rows
        .into_iter()
        .filter(|r| !r.section_id.trim().is_empty())
        .collect())
}

/// Section ids whose latest row succeeded.
pub fn load_succeeded(path: &Path) -> Result<HashSet<String>> {
    Ok(latest_per_section(load_outcomes(path)?)
        .into_iter()
        .filter(|r| !r.is_error())
        .map(|r| r.section_id)
        .collect())
}

/// Fold rows to one per section id: the last row wins, positioned where the
/// id first appeared.
pub fn latest_per_section(rows: Vec<SectionOutcome>) -> Vec<SectionOutcome> {
    let mut slot: HashMap<String, usize> = HashMap::new();
    let mut out: Vec<SectionOutcome> = Vec::new();
    for row in rows {
        match slot.get(&row.section_id) {
            Some(&i) => out[i] = row,
            None => {
                slot.insert(row.section_id.clone(), out.len());
                out.push(row);
            }
        }
    }
    out
}

/// Sections not yet in `done`, with their 1-based position in the volume.
pub fn pending_sections<'a>(
    sections: &'a [Section],
    done: &HashSet<String>,
) -> Vec<(usize, &'a Section)> {
    sections
        .iter()
        .enumerate()
        .filter(|(_, s)| !done.contains(&s.section_id))
        .map(|(i, s)| (i + 1, s))
        .collect()
}

/// Every ledger file under `root`, sorted by path.
pub fn find_ledgers(root: &Path) -> Result<Vec<PathBuf>> {
    if !root.exists() {
        return Ok(Vec::new());
    }
    let mut ledgers = Vec::new();
    for entry in WalkDir::new(root) {
        let entry = entry?;
        if entry.file_type().is_file()
            && entry.file_name().to_string_lossy().ends_with(LEDGER_SUFFIX)
        {
            ledgers.push(entry.into_path());
        }
    }
    ledgers.sort();
    Ok(ledgers)
}

/// Counts describing one ledger file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LedgerSummary {
    pub rows: usize,
    pub malformed: usize,
    pub sections: usize,
    pub failed: usize,
    /// Newest `created_at` in the file.
    pub last_written: Option<DateTime<Utc>>,
}

impl LedgerSummary {
    pub fn read(path: &Path) -> Result<Self> {
        let (rows, malformed) = scan_rows::<SectionOutcome>(path)?;
        let row_count = rows.len();
        let last_written = rows.iter().map(|r| r.created_at).max();
        let latest = latest_per_section(rows);
        Ok(Self {
            rows: row_count,
            malformed,
            sections: latest.len(),
            failed: latest.iter().filter(|r| r.is_error()).count(),
            last_written,
        })
    }
}

/// Appends outcome rows to one volume's ledger.
///
/// Shared by all concurrently dispatching sections of that volume. Each
/// row is written as a single buffer under the lock and flushed before the
/// lock is released, so rows never interleave and a completed row survives
/// the process being killed.
pub struct SectionWriter {
    path: PathBuf,
    file: Mutex<tokio::fs::File>,
}

impl SectionWriter {
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .with_context(|| format!("Failed to open ledger for append: {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn append(&self, outcome: &SectionOutcome) -> Result<()> {
        let mut line = serde_json::to_string(outcome)?;
        line.push('\n');

        let mut file = self.file.lock().await;
        file.write_all(line.as_bytes())
            .await
            .with_context(|| format!("Failed to append to {}", self.path.display()))?;
        file.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::fs;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn outcome(id: &str, error: Option<&str>) -> SectionOutcome {
        SectionOutcome {
            work: "w".into(),
            volume: "1".into(),
            page_title: String::new(),
            url: String::new(),
            section_id: id.into(),
            section_title: String::new(),
            item_ids: vec![],
            model: "m".into(),
            usage: None,
            created_at: Utc::now(),
            extraction: json!({}),
            error: error.map(str::to_string),
        }
    }

    fn section(id: &str) -> Section {
        Section {
            section_id: id.into(),
            section_title: String::new(),
            item_ids: vec![],
            text: "x".into(),
        }
    }

    #[test]
    fn test_missing_ledger_is_empty() {
        let tmp = TempDir::new().unwrap();
        assert!(load_done(&tmp.path().join("none.jsonl")).unwrap().is_empty());
        assert!(load_outcomes(&tmp.path().join("none.jsonl")).unwrap().is_empty());
    }

    #[test]
    fn test_load_done_skips_malformed_lines() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("l.jsonl");
        fs::write(
            &path,
            "{\"section_id\":\"sec_0001\"}\n{broken\n\n{\"section_id\":\"  \"}\n{\"section_id\":\"sec_0002\",\"error\":\"timeout: x\"}\n{\"section_id\":\"sec_00",
        )
        .unwrap();
        let done = load_done(&path).unwrap();
        assert_eq!(done.len(), 2);
        assert!(done.contains("sec_0001"));
        assert!(done.contains("sec_0002"));
    }

    #[test]
    fn test_pending_excludes_failed_and_succeeded() {
        let done: HashSet<String> = ["A", "B"].iter().map(|s| s.to_string()).collect();
        let sections = vec![section("A"), section("B"), section("C")];
        let pending = pending_sections(&sections, &done);
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].0, 3);
        assert_eq!(pending[0].1.section_id, "C");
    }

    #[test]
    fn test_latest_row_wins() {
        let rows = vec![
            outcome("A", Some("timeout: slow")),
            outcome("B", None),
            outcome("A", None),
        ];
        let latest = latest_per_section(rows);
        assert_eq!(latest.len(), 2);
        assert_eq!(latest[0].section_id, "A");
        assert!(!latest[0].is_error());
    }

    #[tokio::test]
    async fn test_writer_appends_and_reads_back() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("w").join("l.jsonl");
        let writer = SectionWriter::open(&path).await.unwrap();
        writer.append(&outcome("sec_0001", None)).await.unwrap();
        writer
            .append(&outcome("sec_0002", Some("transport: refused")))
            .await
            .unwrap();

        let rows = load_outcomes(&path).unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows[1].is_error());
        let raw = fs::read_to_string(&path).unwrap();
        assert!(!raw.lines().next().unwrap().contains("\"error\""));

        let succeeded = load_succeeded(&path).unwrap();
        assert!(succeeded.contains("sec_0001"));
        assert!(!succeeded.contains("sec_0002"));
    }

    #[tokio::test]
    async fn test_concurrent_appends_do_not_interleave() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("l.jsonl");
        let writer = Arc::new(SectionWriter::open(&path).await.unwrap());

        let mut handles = Vec::new();
        for i in 0..32 {
            let writer = writer.clone();
            handles.push(tokio::spawn(async move {
                let mut o = outcome(&format!("sec_{:04}", i), None);
                o.extraction = json!({ "events": ["長".repeat(2000)] });
                writer.append(&o).await.unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let summary = LedgerSummary::read(&path).unwrap();
        assert_eq!(summary.rows, 32);
        assert_eq!(summary.malformed, 0);
        assert_eq!(summary.sections, 32);
    }

    #[test]
    fn test_find_ledgers() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("w");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("w_卷2.sections.extractions.jsonl"), "").unwrap();
        fs::write(dir.join("w_卷1.sections.extractions.jsonl"), "").unwrap();
        fs::write(dir.join("w_卷1.volume.json"), "{}").unwrap();
        let found = find_ledgers(tmp.path()).unwrap();
        assert_eq!(found.len(), 2);
        assert!(found[0].ends_with("w_卷1.sections.extractions.jsonl"));
        assert!(find_ledgers(&tmp.path().join("missing")).unwrap().is_empty());
    }

    #[test]
    fn test_volume_paths() {
        let meta = VolumeMeta {
            work: "資治通鑑".into(),
            volume: "203".into(),
            ..Default::default()
        };
        let paths = VolumePaths::for_volume(Path::new("/out"), &meta);
        assert_eq!(
            paths.ledger,
            Path::new("/out/資治通鑑/資治通鑑_卷203.sections.extractions.jsonl")
        );
        assert_eq!(
            VolumePaths::record_for_ledger(&paths.ledger).unwrap(),
            paths.record
        );
    }
}
