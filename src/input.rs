//! Input discovery and item loading.
//!
//! Volumes arrive as line-delimited JSON files produced by the acquisition
//! step, one file per volume. Files are discovered under `[input].root`
//! with the configured include globs and processed in sorted order.

use anyhow::{bail, Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::Deserialize;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::config::Config;
use crate::models::{ContentItem, ItemKind, VolumeMeta, UNKNOWN_META};

/// One input line: a content item plus the volume metadata it was fetched with.
#[derive(Debug, Clone, Deserialize)]
pub struct InputRecord {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub kind: ItemKind,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub work: Option<String>,
    #[serde(default)]
    pub volume: Option<String>,
    #[serde(default)]
    pub page_title: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
}

impl InputRecord {
    pub fn item(&self) -> ContentItem {
        ContentItem {
            id: self.id.clone(),
            kind: self.kind,
            text: self.text.clone(),
        }
    }
}

impl VolumeMeta {
    /// Volume metadata from the first record. Blank `work` / `volume` fall
    /// back to [`UNKNOWN_META`]; blank `page_title` / `url` stay empty.
    pub fn from_first_record(record: &InputRecord) -> Self {
        fn or_unknown(v: &Option<String>) -> String {
            match v.as_deref().map(str::trim) {
                Some(s) if !s.is_empty() => s.to_string(),
                _ => UNKNOWN_META.to_string(),
            }
        }

        Self {
            work: or_unknown(&record.work),
            volume: or_unknown(&record.volume),
            page_title: record.page_title.clone().unwrap_or_default(),
            url: record.url.clone().unwrap_or_default(),
        }
    }
}

/// Find every input file matching the configured globs, sorted by path.
///
/// Matching zero files is a configuration failure.
pub fn discover_inputs(config: &Config) -> Result<Vec<PathBuf>> {
    let root = &config.input.root;
    if !root.exists() {
        bail!("Input root does not exist: {}", root.display());
    }

    let include_set = build_globset(&config.input.include_globs)?;

    let mut files = Vec::new();
    for entry in WalkDir::new(root).follow_links(true) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let relative = path.strip_prefix(root).unwrap_or(path);
        let rel_str = relative.to_string_lossy().replace('\\', "/");
        if include_set.is_match(&rel_str) {
            files.push(path.to_path_buf());
        }
    }

    if files.is_empty() {
        bail!(
            "No input files matched {:?} under {}",
            config.input.include_globs,
            root.display()
        );
    }

    files.sort();
    Ok(files)
}

/// Read every non-blank line of a volume file.
///
/// Unlike the ledger, a malformed input line fails the whole volume.
pub fn read_items(path: &Path) -> Result<Vec<InputRecord>> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open input file: {}", path.display()))?;

    let mut records = Vec::new();
    for (lineno, line) in BufReader::new(file).lines().enumerate() {
        let line = line.with_context(|| format!("Failed to read {}", path.display()))?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let record: InputRecord = serde_json::from_str(trimmed).with_context(|| {
            format!("Invalid input record at {}:{}", path.display(), lineno + 1)
        })?;
        records.push(record);
    }

    Ok(records)
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_meta_defaults() {
        let rec: InputRecord =
            serde_json::from_str(r#"{"id":"a","kind":"heading","text":"x","work":"  "}"#).unwrap();
        let meta = VolumeMeta::from_first_record(&rec);
        assert_eq!(meta.work, "UNKNOWN");
        assert_eq!(meta.volume, "UNKNOWN");
        assert_eq!(meta.page_title, "");
        assert_eq!(meta.url, "");
    }

    #[test]
    fn test_meta_from_record() {
        let rec: InputRecord = serde_json::from_str(
            r#"{"id":"a","kind":"paragraph","text":"x","work":"資治通鑑","volume":" 203 ","page_title":"t","url":"u"}"#,
        )
        .unwrap();
        let meta = VolumeMeta::from_first_record(&rec);
        assert_eq!(meta.work, "資治通鑑");
        assert_eq!(meta.volume, "203");
        assert_eq!(meta.page_title, "t");
        assert_eq!(meta.url, "u");
    }

    #[test]
    fn test_read_items_skips_blank_lines_and_unknown_kinds() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("v.jsonl");
        fs::write(
            &path,
            "{\"id\":\"1\",\"kind\":\"heading\",\"text\":\"甲\"}\n\n{\"id\":\"2\",\"kind\":\"table\",\"text\":\"t\"}\n",
        )
        .unwrap();
        let records = read_items(&path).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].kind, ItemKind::Heading);
        assert_eq!(records[1].kind, ItemKind::Other);
    }

    #[test]
    fn test_read_items_rejects_malformed_line() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("v.jsonl");
        fs::write(&path, "{\"id\":\"1\"}\nnot json\n").unwrap();
        let err = read_items(&path).unwrap_err();
        assert!(format!("{:#}", err).contains(":2"));
    }
}
