//! Run progress reporting.
//!
//! Reports per-section progress lines and per-volume summaries during
//! `vx run`. Progress is emitted on **stderr** so stdout remains parseable
//! for scripts.

use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

/// Why a volume produced no new work.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SkipReason {
    /// No records in the input file.
    EmptyInput,
    /// Records present but no section had any text.
    NoSections,
    /// Every section is already in the ledger.
    AllDone,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::EmptyInput => "empty input",
            SkipReason::NoSections => "no sections",
            SkipReason::AllDone => "all sections already done",
        }
    }
}

/// A single progress event.
#[derive(Clone, Debug)]
pub enum RunProgressEvent {
    /// Sections known and filtered against the ledger; dispatch starts.
    VolumeStarted {
        volume: String,
        total: usize,
        done: usize,
        pending: usize,
    },
    VolumeSkipped {
        volume: String,
        reason: SkipReason,
    },
    /// A section obtained its dispatch slot.
    SectionStarted {
        index: usize,
        total: usize,
        section_id: String,
        title: String,
    },
    SectionFinished {
        index: usize,
        total: usize,
        section_id: String,
        error_kind: Option<String>,
        elapsed: Duration,
    },
    VolumeMerged {
        volume: String,
        people: usize,
        events: usize,
        relations: usize,
        path: PathBuf,
    },
}

/// Reports run progress. Implementations write to stderr (human or JSON).
pub trait RunProgressReporter: Send + Sync {
    fn report(&self, event: RunProgressEvent);
}

/// Human-friendly progress on stderr: `[3/12] sec_0003 ✓ (41s)`.
pub struct StderrProgress;

impl RunProgressReporter for StderrProgress {
    fn report(&self, event: RunProgressEvent) {
        let line = match &event {
            RunProgressEvent::VolumeStarted {
                volume,
                total,
                done,
                pending,
            } => format!(
                "[vol] {}: {} sections total, {} done, {} pending\n",
                volume, total, done, pending
            ),
            RunProgressEvent::VolumeSkipped { volume, reason } => {
                format!("[skip] {}: {}\n", volume, reason.as_str())
            }
            RunProgressEvent::SectionStarted {
                index,
                total,
                section_id,
                title,
            } => format!(
                "[{}/{}] {} [{}] started\n",
                index,
                total,
                section_id,
                title_preview(title)
            ),
            RunProgressEvent::SectionFinished {
                index,
                total,
                section_id,
                error_kind,
                elapsed,
            } => match error_kind {
                None => format!(
                    "[{}/{}] {} ✓ ({:.0}s)\n",
                    index,
                    total,
                    section_id,
                    elapsed.as_secs_f64()
                ),
                Some(kind) => format!(
                    "[{}/{}] {} ✗ {} ({:.0}s)\n",
                    index,
                    total,
                    section_id,
                    kind,
                    elapsed.as_secs_f64()
                ),
            },
            RunProgressEvent::VolumeMerged {
                volume,
                people,
                events,
                relations,
                path,
            } => format!(
                "[vol] ✓ {}: {} people, {} events, {} relations\n[vol] wrote: {}\n",
                volume,
                people,
                events,
                relations,
                path.display()
            ),
        };
        let mut err = std::io::stderr().lock();
        let _ = err.write_all(line.as_bytes());
        let _ = err.flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl RunProgressReporter for JsonProgress {
    fn report(&self, event: RunProgressEvent) {
        let obj = match &event {
            RunProgressEvent::VolumeStarted {
                volume,
                total,
                done,
                pending,
            } => serde_json::json!({
                "event": "volume_started",
                "volume": volume,
                "total": total,
                "done": done,
                "pending": pending
            }),
            RunProgressEvent::VolumeSkipped { volume, reason } => serde_json::json!({
                "event": "volume_skipped",
                "volume": volume,
                "reason": reason.as_str()
            }),
            RunProgressEvent::SectionStarted {
                index,
                total,
                section_id,
                title,
            } => serde_json::json!({
                "event": "section_started",
                "n": index,
                "total": total,
                "section_id": section_id,
                "title": title
            }),
            RunProgressEvent::SectionFinished {
                index,
                total,
                section_id,
                error_kind,
                elapsed,
            } => serde_json::json!({
                "event": "section_finished",
                "n": index,
                "total": total,
                "section_id": section_id,
                "ok": error_kind.is_none(),
                "error_kind": error_kind,
                "elapsed_secs": elapsed.as_secs_f64()
            }),
            RunProgressEvent::VolumeMerged {
                volume,
                people,
                events,
                relations,
                path,
            } => serde_json::json!({
                "event": "volume_merged",
                "volume": volume,
                "people": people,
                "events": events,
                "relations": relations,
                "path": path.display().to_string()
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let mut err = std::io::stderr().lock();
            let _ = writeln!(err, "{}", line);
            let _ = err.flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl RunProgressReporter for NoProgress {
    fn report(&self, _event: RunProgressEvent) {}
}

fn title_preview(title: &str) -> String {
    if title.is_empty() {
        return "untitled".to_string();
    }
    title.chars().take(30).collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq, clap::ValueEnum)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise JSON lines.
    /// Only an explicit `off` silences progress.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Json
        }
    }

    pub fn reporter(&self) -> Box<dyn RunProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}
