//! Call dispatcher.
//!
//! Turns one [`Section`] into one [`SectionOutcome`] by streaming a
//! completion from the remote service. Failures never escape: a timeout,
//! transport error, rejected request or unparseable answer all become an
//! outcome with `extraction = {}` and `error` set.
//!
//! The number of calls in flight is bounded by a semaphore owned by the
//! dispatcher and shared by every volume in the run.

use chrono::Utc;
use futures::StreamExt;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::config::Config;
use crate::error::DispatchError;
use crate::extraction::parse_answer;
use crate::llm::{ChatMessage, ChatRequest, CompletionClient};
use crate::models::{Section, SectionOutcome, Usage, VolumeMeta};

/// Characters per token used for the usage estimate.
const CHARS_PER_TOKEN: f64 = 1.5;

const SYSTEM_PROMPT: &str = "你是一名面向知识图谱构建的史料信息抽取助手。\
输入是一卷史书中的一个完整小节（以小标题为单位）。\
请从文本中提炼出：时间、地点、人物、人物关系、人物遭遇/行动与事件，并提供可追溯证据。\
要求：只依据原文；不要编造；只输出严格 JSON。";

const OUTPUT_FORMAT: &str = r#"要求输出格式（严格JSON）：
{
  "time_anchors": [{"text": "...", "normalized": "...", "evidence": "...", "confidence": 0.9}],
  "people": [{"name": "...", "aliases": [...], "roles": [...], "offices": [...], "evidence": [...]}],
  "places": [{"name": "...", "aliases": [...], "type": "PLACE|BUILDING|REGION|OTHER", "evidence": [...]}],
  "relations": [{"type": "PERSON_PERSON|PERSON_OFFICE|PERSON_PLACE|PERSON_EVENT", "from": "...", "to": "...", "relation": "...", "time": "...", "place": "...", "evidence": "...", "confidence": 0.9}],
  "events": [{"event_name": "...", "event_type": "...", "time": "...", "place": "...", "participants": [...], "description": "...", "outcomes": [...], "evidence": [...], "confidence": 0.9}]
}

规则：section_title 包含关键时间信息，对相对时间要结合标题给出明确 time"#;

/// Build the system and user messages for one section.
pub fn build_messages(section: &Section) -> Vec<ChatMessage> {
    let user = format!(
        "从以下史料中抽取结构化信息：\n\n【小节标题】{}\n\n【小节内容】\n{}\n\n{}",
        section.section_title, section.text, OUTPUT_FORMAT
    );
    vec![ChatMessage::system(SYSTEM_PROMPT), ChatMessage::user(user)]
}

impl Usage {
    pub fn from_counts(thinking_chars: u64, content_chars: u64) -> Self {
        Self {
            thinking_chars,
            content_chars,
            estimated_thinking_tokens: (thinking_chars as f64 / CHARS_PER_TOKEN) as u64,
            estimated_content_tokens: (content_chars as f64 / CHARS_PER_TOKEN) as u64,
        }
    }
}

/// Per-call settings taken from config.
#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub model: String,
    pub temperature: f32,
    pub timeout: Duration,
    pub enable_thinking: bool,
    /// Held after each call completes, before the permit is released.
    pub post_delay: Duration,
}

impl DispatchSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            model: config.llm.model.clone(),
            temperature: config.llm.temperature,
            timeout: config.llm.timeout(),
            enable_thinking: config.llm.enable_thinking,
            post_delay: config.run.post_delay(),
        }
    }
}

/// Streams section extractions under a run-wide concurrency limit.
pub struct Dispatcher {
    client: Arc<dyn CompletionClient>,
    limiter: Arc<Semaphore>,
    settings: DispatchSettings,
}

impl Dispatcher {
    pub fn new(client: Arc<dyn CompletionClient>, concurrency: usize, settings: DispatchSettings) -> Self {
        Self {
            client,
            limiter: Arc::new(Semaphore::new(concurrency.max(1))),
            settings,
        }
    }

    pub fn settings(&self) -> &DispatchSettings {
        &self.settings
    }

    /// Wait for an in-flight slot. Hold the permit across the call, the
    /// ledger write and the post-call delay.
    pub async fn permit(&self) -> anyhow::Result<OwnedSemaphorePermit> {
        Ok(self.limiter.clone().acquire_owned().await?)
    }

    /// Slots currently free.
    pub fn available(&self) -> usize {
        self.limiter.available_permits()
    }

    /// Extract one section. Never fails; failures are recorded in the outcome.
    pub async fn dispatch(&self, meta: &VolumeMeta, section: &Section) -> SectionOutcome {
        let result = tokio::time::timeout(self.settings.timeout, self.call(section))
            .await
            .unwrap_or(Err(DispatchError::Timeout(self.settings.timeout)));

        let mut outcome = SectionOutcome {
            work: meta.work.clone(),
            volume: meta.volume.clone(),
            page_title: meta.page_title.clone(),
            url: meta.url.clone(),
            section_id: section.section_id.clone(),
            section_title: section.section_title.clone(),
            item_ids: section.item_ids.clone(),
            model: self.settings.model.clone(),
            usage: None,
            created_at: Utc::now(),
            extraction: json!({}),
            error: None,
        };

        match result {
            Ok((extraction, usage)) => {
                outcome.extraction = extraction;
                outcome.usage = Some(usage);
            }
            Err(e) => {
                tracing::debug!(section = %section.section_id, error = %e, kind = e.kind(), "dispatch failed");
                outcome.error = Some(e.diagnostic());
            }
        }
        outcome
    }

    async fn call(&self, section: &Section) -> Result<(Value, Usage), DispatchError> {
        let request = ChatRequest {
            model: self.settings.model.clone(),
            messages: build_messages(section),
            temperature: self.settings.temperature,
            enable_thinking: self.settings.enable_thinking,
            stream: true,
            timeout: self.settings.timeout,
        };

        let mut stream = self.client.stream_chat(&request).await?;

        let mut thinking_chars = 0u64;
        let mut content_chars = 0u64;
        let mut answer = String::new();
        while let Some(delta) = stream.next().await {
            let delta = delta?;
            if let Some(r) = delta.reasoning.as_deref() {
                thinking_chars += r.chars().count() as u64;
            }
            if let Some(c) = delta.content.as_deref() {
                content_chars += c.chars().count() as u64;
                answer.push_str(c);
            }
        }

        let extraction = parse_answer(&answer)?;
        Ok((extraction, Usage::from_counts(thinking_chars, content_chars)))
    }
}
