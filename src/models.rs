//! Core data models used throughout the extraction pipeline.
//!
//! These types represent the content items, sections, per-section outcomes,
//! and merged volume records that flow from input files through the ledger
//! to the final volume JSON.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::merge::EntityIndex;

/// Placeholder used for blank `work` / `volume` metadata.
pub const UNKNOWN_META: &str = "UNKNOWN";

/// Kind of an input content item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemKind {
    Heading,
    Paragraph,
    /// Any other kind emitted by the acquisition step; ignored by the sectionizer.
    #[default]
    #[serde(other)]
    Other,
}

/// One typed content item. Ordering within a volume is significant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentItem {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub kind: ItemKind,
    #[serde(default)]
    pub text: String,
}

impl ContentItem {
    pub fn heading(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: ItemKind::Heading,
            text: text.into(),
        }
    }

    pub fn paragraph(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: ItemKind::Paragraph,
            text: text.into(),
        }
    }
}

/// A heading-anchored span of content, the unit of extraction.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Section {
    pub section_id: String,
    pub section_title: String,
    pub item_ids: Vec<String>,
    pub text: String,
}

/// Per-volume metadata taken from the first input record.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct VolumeMeta {
    pub work: String,
    pub volume: String,
    pub page_title: String,
    pub url: String,
}

/// Stream telemetry for one completed call. Counts are characters, not bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Usage {
    pub thinking_chars: u64,
    pub content_chars: u64,
    pub estimated_thinking_tokens: u64,
    pub estimated_content_tokens: u64,
}

/// The recorded result of dispatching one section: one ledger line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SectionOutcome {
    #[serde(default)]
    pub work: String,
    #[serde(default)]
    pub volume: String,
    #[serde(default)]
    pub page_title: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub section_id: String,
    #[serde(default)]
    pub section_title: String,
    #[serde(default)]
    pub item_ids: Vec<String>,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub usage: Option<Usage>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "empty_object")]
    pub extraction: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

fn empty_object() -> Value {
    Value::Object(Default::default())
}

impl SectionOutcome {
    /// True when the ledger row recorded a failure.
    pub fn is_error(&self) -> bool {
        self.error.as_deref().is_some_and(|e| !e.is_empty())
    }

    pub fn section_ref(&self) -> SectionRef {
        SectionRef {
            section_id: self.section_id.clone(),
            section_title: self.section_title.clone(),
            item_ids: self.item_ids.clone(),
        }
    }
}

/// Section identity echoed in the merged volume record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SectionRef {
    pub section_id: String,
    pub section_title: String,
    pub item_ids: Vec<String>,
}

/// Deduplicated aggregate of all successful section outcomes for a volume.
#[derive(Debug, Clone, Serialize)]
pub struct VolumeRecord {
    pub work: String,
    pub volume: String,
    pub page_title: String,
    pub url: String,
    pub generated_at: DateTime<Utc>,
    pub time_anchors: Vec<Value>,
    pub people: EntityIndex,
    pub places: EntityIndex,
    pub relations: Vec<Value>,
    pub events: Vec<Value>,
    pub sections: Vec<SectionRef>,
}
