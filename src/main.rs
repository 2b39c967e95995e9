//! # Volume Extract CLI (`vx`)
//!
//! The `vx` binary drives the section extraction pipeline: it segments
//! volume files into titled sections, sends each section to an
//! OpenAI-compatible completion service under a concurrency limit, records
//! every result in a per-volume ledger, and merges the results into one
//! record per volume.
//!
//! ## Usage
//!
//! ```bash
//! vx --config ./config/vx.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `vx run` | Extract every pending section and merge each volume |
//! | `vx merge` | Rebuild volume records from the ledgers alone |
//! | `vx status` | Summarise ledgers under the output root |
//!
//! ## Examples
//!
//! ```bash
//! # Preview how many sections would be dispatched
//! vx run --dry-run
//!
//! # Resume an interrupted run with 8 calls in flight
//! vx run --resume --concurrency 8
//!
//! # Re-dispatch only sections whose last attempt failed
//! vx run --retry-failed
//! ```

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use volume_extract::config::{self, RunOverrides};
use volume_extract::progress::ProgressMode;
use volume_extract::{run, stats};

const DEFAULT_CONFIG: &str = "./config/vx.toml";

/// Volume Extract: resumable, bounded-concurrency section extraction for
/// long historical texts.
#[derive(Parser)]
#[command(
    name = "vx",
    about = "Volume Extract: resumable section extraction for long historical texts",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/vx.toml`; when that file is absent the built-in
    /// defaults are used. An explicitly given path must exist.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Extract every pending section and write merged volume records.
    ///
    /// Sections already present in a volume's ledger are skipped when
    /// resuming. Reads the API key from the environment variable named by
    /// `llm.api_key_env` (default `DASHSCOPE_API_KEY`).
    Run {
        /// Directory searched for volume files.
        #[arg(long)]
        input_root: Option<PathBuf>,

        /// Glob (relative to the input root) selecting volume files. Repeatable.
        #[arg(long = "include")]
        include: Vec<String>,

        /// Output root for ledgers and volume records.
        #[arg(long)]
        out_root: Option<PathBuf>,

        #[arg(long)]
        model: Option<String>,

        #[arg(long)]
        base_url: Option<String>,

        #[arg(long)]
        temperature: Option<f32>,

        /// Per-call timeout in seconds.
        #[arg(long)]
        timeout: Option<f64>,

        /// Maximum calls in flight across the whole run.
        #[arg(long)]
        concurrency: Option<usize>,

        /// Seconds to wait after each call before its slot is released.
        #[arg(long)]
        sleep: Option<f64>,

        /// Skip sections that already have a ledger row.
        #[arg(long)]
        resume: bool,

        /// Resume, but re-dispatch sections whose latest row failed.
        #[arg(long)]
        retry_failed: bool,

        /// Dispatch at most this many sections per volume.
        #[arg(long)]
        max_sections: Option<usize>,

        /// Stop after this many volumes.
        #[arg(long)]
        max_volumes: Option<usize>,

        /// Progress output on stderr. Defaults to `human` on a TTY, else `json`.
        #[arg(long, value_enum)]
        progress: Option<ProgressMode>,

        /// Show per-volume section counts without calling the service.
        #[arg(long)]
        dry_run: bool,
    },

    /// Rebuild every volume record from its ledger.
    Merge {
        /// Output root holding the ledgers.
        #[arg(long)]
        out_root: Option<PathBuf>,
    },

    /// Summarise ledgers under the output root.
    Status {
        #[arg(long)]
        out_root: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    let mut cfg = match &cli.config {
        Some(path) => config::load_config(path, true)?,
        None => config::load_config(&PathBuf::from(DEFAULT_CONFIG), false)?,
    };

    match cli.command {
        Commands::Run {
            input_root,
            include,
            out_root,
            model,
            base_url,
            temperature,
            timeout,
            concurrency,
            sleep,
            resume,
            retry_failed,
            max_sections,
            max_volumes,
            progress,
            dry_run,
        } => {
            cfg.apply(RunOverrides {
                input_root,
                include_globs: include,
                output_root: out_root,
                model,
                base_url,
                temperature,
                timeout_secs: timeout,
                concurrency,
                sleep_secs: sleep,
                resume,
                retry_failed,
                max_sections,
                max_volumes,
            });
            let mode = progress.unwrap_or_else(ProgressMode::default_for_tty);
            run::run_extract(&cfg, mode, dry_run).await?;
        }
        Commands::Merge { out_root } => {
            if let Some(root) = out_root {
                cfg.output.root = root;
            }
            run::run_merge(&cfg)?;
        }
        Commands::Status { out_root } => {
            if let Some(root) = out_root {
                cfg.output.root = root;
            }
            stats::run_status(&cfg)?;
        }
    }

    Ok(())
}
