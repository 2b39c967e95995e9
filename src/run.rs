//! Run coordinator.
//!
//! Drives volumes one after another through the pipeline:
//!
//! ```text
//! load → segment → (no sections: skip) → filter against ledger
//!      → (nothing pending: skip) → dispatch (bounded, concurrent)
//!      → merge → write volume record
//! ```
//!
//! Within a volume all pending sections are polled concurrently on the
//! current task; the dispatcher's semaphore bounds how many are mid-call
//! across the whole run. A failure in one volume is logged and the run
//! moves on. On interrupt, in-flight sections finish and are written,
//! sections still waiting for a slot are not attempted, and the run stops
//! before the next volume. A second interrupt exits at once.

use anyhow::{Context, Result};
use futures::future::join_all;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::config::{Config, RunConfig};
use crate::dispatch::{DispatchSettings, Dispatcher};
use crate::input::{discover_inputs, read_items, InputRecord};
use crate::ledger::{
    self, latest_per_section, load_done, load_outcomes, load_succeeded, pending_sections,
    SectionWriter, VolumePaths,
};
use crate::llm::{CompletionClient, OpenAiCompatClient};
use crate::merge::merge_volume;
use crate::models::{ContentItem, Section, SectionOutcome, VolumeMeta, VolumeRecord};
use crate::progress::{ProgressMode, RunProgressEvent, RunProgressReporter, SkipReason};
use crate::section::segment;

/// Everything a run shares: config, the dispatcher with its run-wide
/// limiter, the progress sink and the interrupt flag.
pub struct RunContext {
    config: Config,
    dispatcher: Dispatcher,
    progress: Box<dyn RunProgressReporter>,
    interrupted: Arc<AtomicBool>,
}

impl RunContext {
    pub fn new(
        config: Config,
        client: Arc<dyn CompletionClient>,
        progress: Box<dyn RunProgressReporter>,
    ) -> Self {
        let dispatcher = Dispatcher::new(
            client,
            config.run.concurrency,
            DispatchSettings::from_config(&config),
        );
        Self {
            config,
            dispatcher,
            progress,
            interrupted: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Setting the flag stops the run before the next volume.
    pub fn interrupt_handle(&self) -> Arc<AtomicBool> {
        self.interrupted.clone()
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }
}

/// Counters for one run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunStats {
    /// Volumes that completed normally, skipped ones included.
    pub volumes_processed: usize,
    pub volumes_skipped: usize,
    pub volumes_failed: usize,
    pub sections_succeeded: usize,
    pub sections_failed: usize,
    /// Pending sections never dispatched because the run was interrupted.
    pub sections_cancelled: usize,
    pub interrupted: bool,
}

/// How a volume left the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum VolumeOutcome {
    Skipped(SkipReason),
    Merged {
        record: PathBuf,
        sections_succeeded: usize,
        sections_failed: usize,
        sections_cancelled: usize,
        people: usize,
        events: usize,
        relations: usize,
    },
}

/// `vx run`: discover inputs, connect, and process every volume.
pub async fn run_extract(config: &Config, mode: ProgressMode, dry_run: bool) -> Result<()> {
    config.validate()?;
    let inputs = discover_inputs(config)?;

    if dry_run {
        return print_dry_run(config, &inputs);
    }

    let client = Arc::new(OpenAiCompatClient::from_config(&config.llm)?);
    let ctx = RunContext::new(config.clone(), client, mode.reporter());

    let flag = ctx.interrupt_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        tracing::warn!("interrupt received, draining in-flight sections (Ctrl-C again to quit now)");
        flag.store(true, Ordering::SeqCst);

        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("second interrupt, exiting without draining");
            std::process::exit(130);
        }
    });

    tracing::info!(
        inputs = inputs.len(),
        model = %config.llm.model,
        concurrency = config.run.concurrency,
        timeout_secs = config.llm.timeout_secs,
        output = %config.output.root.display(),
        "starting extraction run"
    );

    let stats = run_volumes(&ctx, &inputs).await;

    println!("run{}", if stats.interrupted { " (interrupted)" } else { "" });
    println!("  inputs: {}", inputs.len());
    println!("  volumes processed: {}", stats.volumes_processed);
    println!("  volumes skipped: {}", stats.volumes_skipped);
    println!("  volumes failed: {}", stats.volumes_failed);
    println!("  sections succeeded: {}", stats.sections_succeeded);
    println!("  sections failed: {}", stats.sections_failed);
    if stats.sections_cancelled > 0 {
        println!("  sections not attempted: {}", stats.sections_cancelled);
    }
    println!("ok");
    Ok(())
}

/// Process volumes in order, applying the volume cap and the interrupt flag.
pub async fn run_volumes(ctx: &RunContext, inputs: &[PathBuf]) -> RunStats {
    let mut stats = RunStats::default();

    for path in inputs {
        if ctx.is_interrupted() {
            stats.interrupted = true;
            break;
        }

        match process_volume(ctx, path).await {
            Ok(VolumeOutcome::Skipped(_)) => {
                stats.volumes_processed += 1;
                stats.volumes_skipped += 1;
            }
            Ok(VolumeOutcome::Merged {
                sections_succeeded,
                sections_failed,
                sections_cancelled,
                ..
            }) => {
                stats.volumes_processed += 1;
                stats.sections_succeeded += sections_succeeded;
                stats.sections_failed += sections_failed;
                stats.sections_cancelled += sections_cancelled;
            }
            Err(e) => {
                stats.volumes_failed += 1;
                tracing::error!(volume = %path.display(), error = %format!("{:#}", e), "volume failed");
            }
        }

        if let Some(max) = ctx.config.run.max_volumes {
            if stats.volumes_processed >= max {
                break;
            }
        }
    }

    if ctx.is_interrupted() {
        stats.interrupted = true;
    }
    stats
}

/// Run a blocking file operation off the async workers.
async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f).await?
}

/// Run one volume file through the whole pipeline.
///
/// After an interrupt, sections still waiting for a slot are dropped
/// without a ledger row; the record is merged from what was written.
pub async fn process_volume(ctx: &RunContext, path: &Path) -> Result<VolumeOutcome> {
    let input = path.to_path_buf();
    let records = blocking(move || read_items(&input)).await?;
    let Some(first) = records.first() else {
        return Ok(skip(ctx, path.display().to_string(), SkipReason::EmptyInput));
    };

    let meta = VolumeMeta::from_first_record(first);
    let label = volume_label(&meta);
    let items: Vec<ContentItem> = records.iter().map(InputRecord::item).collect();
    let sections = segment(&items);
    if sections.is_empty() {
        return Ok(skip(ctx, label, SkipReason::NoSections));
    }

    let paths = VolumePaths::for_volume(&ctx.config.output.root, &meta);
    let run_config = ctx.config.run.clone();
    let ledger_path = paths.ledger.clone();
    let (done, prior) = blocking(move || {
        let done = done_sections(&run_config, &ledger_path)?;
        let prior = if run_config.resumes() {
            load_outcomes(&ledger_path)?
        } else {
            Vec::new()
        };
        Ok((done, prior))
    })
    .await?;
    let mut pending = pending_sections(&sections, &done);
    if let Some(max) = ctx.config.run.max_sections {
        pending.truncate(max);
    }
    if pending.is_empty() {
        return Ok(skip(ctx, label, SkipReason::AllDone));
    }

    ctx.progress.report(RunProgressEvent::VolumeStarted {
        volume: label.clone(),
        total: sections.len(),
        done: done.len(),
        pending: pending.len(),
    });

    let writer = SectionWriter::open(&paths.ledger).await?;
    let total = sections.len();
    let results = join_all(
        pending
            .iter()
            .map(|&(index, section)| process_section(ctx, &meta, &writer, index, total, section)),
    )
    .await;

    let mut fresh = Vec::with_capacity(results.len());
    let mut sections_cancelled = 0usize;
    for result in results {
        match result? {
            Some(outcome) => fresh.push(outcome),
            None => sections_cancelled += 1,
        }
    }
    if sections_cancelled > 0 {
        tracing::warn!(volume = %label, cancelled = sections_cancelled, "interrupted, pending sections not attempted");
    }
    let sections_failed = fresh.iter().filter(|r| r.is_error()).count();
    let sections_succeeded = fresh.len() - sections_failed;

    let merge_input: Vec<SectionOutcome> = latest_per_section(prior.into_iter().chain(fresh).collect())
        .into_iter()
        .filter(|r| !r.is_error())
        .collect();
    let record = merge_volume(&meta, &merge_input);
    let (people, events, relations) = (
        record.people.len(),
        record.events.len(),
        record.relations.len(),
    );
    let record_path = paths.record.clone();
    blocking(move || write_record(&record_path, &record)).await?;

    ctx.progress.report(RunProgressEvent::VolumeMerged {
        volume: label,
        people,
        events,
        relations,
        path: paths.record.clone(),
    });

    Ok(VolumeOutcome::Merged {
        record: paths.record,
        sections_succeeded,
        sections_failed,
        sections_cancelled,
        people,
        events,
        relations,
    })
}

/// One section: wait for a slot, call, record, then hold the slot for the
/// post-call delay. `None` when the run was interrupted before the slot
/// was granted.
async fn process_section(
    ctx: &RunContext,
    meta: &VolumeMeta,
    writer: &SectionWriter,
    index: usize,
    total: usize,
    section: &Section,
) -> Result<Option<SectionOutcome>> {
    let _permit = ctx.dispatcher.permit().await?;
    if ctx.is_interrupted() {
        return Ok(None);
    }

    ctx.progress.report(RunProgressEvent::SectionStarted {
        index,
        total,
        section_id: section.section_id.clone(),
        title: section.section_title.clone(),
    });
    let started = Instant::now();

    let outcome = ctx.dispatcher.dispatch(meta, section).await;
    writer.append(&outcome).await?;

    ctx.progress.report(RunProgressEvent::SectionFinished {
        index,
        total,
        section_id: section.section_id.clone(),
        error_kind: outcome.error.as_deref().map(error_kind),
        elapsed: started.elapsed(),
    });

    let delay = ctx.dispatcher.settings().post_delay;
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
    Ok(Some(outcome))
}

fn done_sections(run: &RunConfig, ledger: &Path) -> Result<HashSet<String>> {
    if run.retry_failed {
        load_succeeded(ledger)
    } else if run.resume {
        load_done(ledger)
    } else {
        Ok(HashSet::new())
    }
}

fn skip(ctx: &RunContext, volume: String, reason: SkipReason) -> VolumeOutcome {
    ctx.progress
        .report(RunProgressEvent::VolumeSkipped { volume, reason });
    VolumeOutcome::Skipped(reason)
}

fn volume_label(meta: &VolumeMeta) -> String {
    format!("{} 卷{}", meta.work, meta.volume)
}

/// The kind prefix of a recorded `"<kind>: <message>"` diagnostic.
fn error_kind(error: &str) -> String {
    error.split(": ").next().unwrap_or(error).to_string()
}

/// Overwrite a volume record with pretty-printed JSON.
pub fn write_record(path: &Path, record: &VolumeRecord) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(record)?;
    std::fs::write(path, json)
        .with_context(|| format!("Failed to write volume record: {}", path.display()))?;
    Ok(())
}

fn print_dry_run(config: &Config, inputs: &[PathBuf]) -> Result<()> {
    println!("run (dry-run)");
    println!("  inputs: {}", inputs.len());

    let mut total_pending = 0usize;
    for (n, path) in inputs.iter().enumerate() {
        if let Some(max) = config.run.max_volumes {
            if n >= max {
                break;
            }
        }

        let records = read_items(path)?;
        let Some(first) = records.first() else {
            println!("  {}: empty", path.display());
            continue;
        };
        let meta = VolumeMeta::from_first_record(first);
        let items: Vec<ContentItem> = records.iter().map(InputRecord::item).collect();
        let sections = segment(&items);
        let paths = VolumePaths::for_volume(&config.output.root, &meta);
        let done = done_sections(&config.run, &paths.ledger)?;
        let remaining = pending_sections(&sections, &done).len();
        let pending = match config.run.max_sections {
            Some(max) => remaining.min(max),
            None => remaining,
        };
        total_pending += pending;

        println!(
            "  {}: {} sections, {} done, {} pending",
            volume_label(&meta),
            sections.len(),
            sections.len() - remaining,
            pending
        );
    }
    println!("  sections to dispatch: {}", total_pending);
    Ok(())
}

/// `vx merge`: rebuild every volume record under the output root from its
/// ledger alone.
pub fn run_merge(config: &Config) -> Result<()> {
    let ledgers = ledger::find_ledgers(&config.output.root)?;
    println!("merge");
    println!("  ledgers found: {}", ledgers.len());

    let mut written = 0usize;
    for path in &ledgers {
        let rows = latest_per_section(load_outcomes(path)?);
        let Some(first) = rows.first() else {
            tracing::warn!(ledger = %path.display(), "ledger has no readable rows, skipped");
            continue;
        };
        let meta = VolumeMeta {
            work: first.work.clone(),
            volume: first.volume.clone(),
            page_title: first.page_title.clone(),
            url: first.url.clone(),
        };
        let ok: Vec<SectionOutcome> = rows.into_iter().filter(|r| !r.is_error()).collect();
        let record = merge_volume(&meta, &ok);

        let Some(record_path) = VolumePaths::record_for_ledger(path) else {
            continue;
        };
        write_record(&record_path, &record)?;
        written += 1;
        println!(
            "  {}: {} people, {} events, {} relations",
            volume_label(&meta),
            record.people.len(),
            record.events.len(),
            record.relations.len()
        );
    }

    println!("  volume records written: {}", written);
    println!("ok");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_prefix() {
        assert_eq!(error_kind("timeout: no completion within 1s"), "timeout");
        assert_eq!(error_kind("invalid_json: expected `:` at line 1"), "invalid_json");
        assert_eq!(error_kind("odd"), "odd");
    }

    #[test]
    fn test_volume_label() {
        let meta = VolumeMeta {
            work: "資治通鑑".into(),
            volume: "199".into(),
            ..Default::default()
        };
        assert_eq!(volume_label(&meta), "資治通鑑 卷199");
    }
}
