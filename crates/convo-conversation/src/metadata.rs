use chrono::{DateTime, Utc};
use convo_core::TokenUsage;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

const PREVIEW_CHARS: usize = 50;

/// Descriptive data attached to a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMetadata {
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_summary: Option<String>,
    /// Free-form host data, stored alongside the well-known keys.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl SessionMetadata {
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            created_at: now,
            last_active_at: now,
            tags: Vec::new(),
            last_summary: None,
            extra: Map::new(),
        }
    }

    /// Append a new summary after any existing one.
    pub fn merge_summary(&mut self, summary: &str) {
        if summary.is_empty() {
            return;
        }
        self.last_summary = Some(match self.last_summary.take() {
            Some(prior) if !prior.is_empty() => format!("{prior}\n\n{summary}"),
            _ => summary.to_string(),
        });
    }
}

impl Default for SessionMetadata {
    fn default() -> Self {
        Self::new()
    }
}

/// Cumulative usage for a session
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionMetrics {
    pub total_tokens_used: u64,
    pub total_prompt_tokens: u64,
    pub total_completion_tokens: u64,
    pub execution_count: u64,
    /// Prompt size of the most recent model call, compared against the
    /// compressor's token watermark.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_prompt_tokens: Option<u64>,
}

/// Partial usage update; absent fields leave the totals unchanged.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsDelta {
    pub tokens_used: Option<u64>,
    pub prompt_tokens: Option<u64>,
    pub completion_tokens: Option<u64>,
}

impl MetricsDelta {
    pub fn tokens_used(tokens: u64) -> Self {
        Self {
            tokens_used: Some(tokens),
            ..Default::default()
        }
    }

    pub fn prompt_tokens(tokens: u64) -> Self {
        Self {
            prompt_tokens: Some(tokens),
            ..Default::default()
        }
    }

    pub fn completion_tokens(tokens: u64) -> Self {
        Self {
            completion_tokens: Some(tokens),
            ..Default::default()
        }
    }
}

impl From<&TokenUsage> for MetricsDelta {
    fn from(usage: &TokenUsage) -> Self {
        Self {
            tokens_used: Some(usage.total_tokens),
            prompt_tokens: Some(usage.prompt_tokens),
            completion_tokens: Some(usage.completion_tokens),
        }
    }
}

/// Summary of a session for listing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub id: String,
    pub preview: String,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
    pub item_count: usize,
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fork_at_item_index: Option<usize>,
}

/// Shorten `text` to the preview length, appending an ellipsis when cut.
pub(crate) fn truncate_preview(text: &str) -> String {
    let text = text.trim();
    if text.chars().count() <= PREVIEW_CHARS {
        return text.to_string();
    }
    let cut: String = text.chars().take(PREVIEW_CHARS).collect();
    format!("{}...", cut.trim_end())
}
