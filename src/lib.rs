//! # Volume Extract
//!
//! A resumable, bounded-concurrency pipeline that turns long historical
//! texts into structured knowledge-graph records.
//!
//! Each volume file is segmented into titled sections. Every section is
//! sent to an OpenAI-compatible completion service, and each result is
//! appended to a per-volume ledger the moment it arrives. Once a volume's
//! sections are done, the successful extractions are merged into one
//! deduplicated volume record.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────┐   ┌────────────┐   ┌──────────┐
//! │  Input   │──▶│ Section  │──▶│ Dispatcher │──▶│  Ledger  │
//! │  JSONL   │   │ segment  │   │ (bounded)  │   │  JSONL   │
//! └──────────┘   └──────────┘   └────────────┘   └────┬─────┘
//!                                                     ▼
//!                                               ┌──────────┐
//!                                               │  Merge   │
//!                                               │ .volume  │
//!                                               └──────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration and CLI overrides |
//! | [`models`] | Core data types |
//! | [`input`] | Volume discovery and record loading |
//! | [`section`] | Heading-driven segmentation |
//! | [`ledger`] | Append-only completion ledger |
//! | [`llm`] | Streaming completion client |
//! | [`extraction`] | Answer parsing |
//! | [`dispatch`] | One section, one bounded call |
//! | [`merge`] | Per-volume entity merge |
//! | [`run`] | Run coordinator |
//! | [`progress`] | Progress reporting |
//! | [`stats`] | Ledger overview |
//! | [`error`] | Dispatch failure kinds |

pub mod config;
pub mod dispatch;
pub mod error;
pub mod extraction;
pub mod input;
pub mod ledger;
pub mod llm;
pub mod merge;
pub mod models;
pub mod progress;
pub mod run;
pub mod section;
pub mod stats;
