use chrono::Utc;
use convo_core::{ConvoError, Item, MessageRole, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::metadata::{truncate_preview, MetricsDelta, SessionMetadata, SessionMetrics, SessionSummary};

/// A conversation log with fork lineage, metadata and usage totals.
///
/// The serialized form of this type is the at-rest format every
/// [`SessionStorage`](crate::SessionStorage) implementation round-trips.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    id: String,
    #[serde(default)]
    items: Vec<Item>,
    #[serde(default)]
    metadata: SessionMetadata,
    #[serde(default)]
    metrics: SessionMetrics,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    parent_session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    fork_at_item_index: Option<usize>,
}

impl Session {
    pub fn new() -> Self {
        Self::with_id(Uuid::new_v4().to_string())
    }

    pub fn with_id(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            items: Vec::new(),
            metadata: SessionMetadata::new(),
            metrics: SessionMetrics::default(),
            parent_session_id: None,
            fork_at_item_index: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn parent_session_id(&self) -> Option<&str> {
        self.parent_session_id.as_deref()
    }

    pub fn fork_at_item_index(&self) -> Option<usize> {
        self.fork_at_item_index
    }

    pub fn metadata(&self) -> &SessionMetadata {
        &self.metadata
    }

    pub fn metrics(&self) -> &SessionMetrics {
        &self.metrics
    }

    pub fn item_count(&self) -> usize {
        self.items.len()
    }

    pub fn add_items(&mut self, items: impl IntoIterator<Item = Item>) {
        self.items.extend(items);
        self.touch();
    }

    /// Copy of the log, or of its last `limit` items.
    pub fn get_items(&self, limit: Option<usize>) -> Vec<Item> {
        match limit {
            Some(limit) => {
                let start = self.items.len().saturating_sub(limit);
                self.items[start..].to_vec()
            }
            None => self.items.clone(),
        }
    }

    pub fn items(&self) -> &[Item] {
        &self.items
    }

    pub fn pop_item(&mut self) -> Option<Item> {
        let item = self.items.pop();
        if item.is_some() {
            self.touch();
        }
        item
    }

    /// Empties the log. Metrics and metadata are kept.
    pub fn clear(&mut self) {
        self.items.clear();
        self.touch();
    }

    pub(crate) fn replace_items(&mut self, items: Vec<Item>) {
        self.items = items;
    }

    pub(crate) fn metadata_mut(&mut self) -> &mut SessionMetadata {
        &mut self.metadata
    }

    pub(crate) fn reset_last_prompt_tokens(&mut self) {
        self.metrics.last_prompt_tokens = None;
    }

    /// Branch a new session from `items[0..=at_index]`.
    ///
    /// Defaults to the last item. The fork gets a fresh id, zeroed metrics
    /// and new timestamps; it shares no state with `self`.
    pub fn fork(&self, at_index: Option<usize>) -> Result<Session> {
        let len = self.items.len();
        let index = match at_index {
            Some(index) => index,
            None => len
                .checked_sub(1)
                .ok_or(ConvoError::OutOfRange { index: -1, len })?,
        };
        if index >= len {
            return Err(ConvoError::OutOfRange {
                index: index as i64,
                len,
            });
        }

        let now = Utc::now();
        let mut metadata = self.metadata.clone();
        metadata.created_at = now;
        metadata.last_active_at = now;

        Ok(Session {
            id: Uuid::new_v4().to_string(),
            items: self.items[..=index].to_vec(),
            metadata,
            metrics: SessionMetrics::default(),
            parent_session_id: Some(self.id.clone()),
            fork_at_item_index: Some(index),
        })
    }

    /// Counts one execution regardless of which fields are present.
    pub fn add_metrics(&mut self, delta: MetricsDelta) {
        if let Some(tokens) = delta.tokens_used {
            self.metrics.total_tokens_used += tokens;
        }
        if let Some(tokens) = delta.prompt_tokens {
            self.metrics.total_prompt_tokens += tokens;
            self.metrics.last_prompt_tokens = Some(tokens);
        }
        if let Some(tokens) = delta.completion_tokens {
            self.metrics.total_completion_tokens += tokens;
        }
        self.metrics.execution_count += 1;
    }

    pub fn add_tag(&mut self, tag: impl Into<String>) {
        let tag = tag.into();
        if !self.metadata.tags.contains(&tag) {
            self.metadata.tags.push(tag);
        }
    }

    pub fn set_metadata(&mut self, key: impl Into<String>, value: Value) {
        self.metadata.extra.insert(key.into(), value);
    }

    pub fn get_summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.id.clone(),
            preview: self.preview(),
            created_at: self.metadata.created_at,
            last_active_at: self.metadata.last_active_at,
            item_count: self.items.len(),
            tags: self.metadata.tags.clone(),
            parent_session_id: self.parent_session_id.clone(),
            fork_at_item_index: self.fork_at_item_index,
        }
    }

    fn preview(&self) -> String {
        let first_user = self.items.iter().find_map(|item| match item {
            Item::Message {
                role: MessageRole::User,
                content,
            } if !content.trim().is_empty() => Some(content.as_str()),
            _ => None,
        });

        first_user
            .or(self.metadata.last_summary.as_deref())
            .map(truncate_preview)
            .unwrap_or_default()
    }

    /// Items to send to a model: the stored summary, if any, as a leading
    /// system message followed by the log.
    pub fn context_items(&self) -> Vec<Item> {
        let mut items = Vec::with_capacity(self.items.len() + 1);
        if let Some(summary) = self.metadata.last_summary.as_deref().filter(|s| !s.is_empty()) {
            items.push(Item::system(format!(
                "Summary of the earlier conversation:\n{summary}"
            )));
        }
        items.extend(self.items.iter().cloned());
        items
    }

    pub fn to_json(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn from_json(data: Value) -> Result<Session> {
        match data.get("id") {
            Some(Value::String(id)) if !id.is_empty() => {}
            _ => {
                return Err(ConvoError::InvalidSessionData(
                    "missing required field `id`".to_string(),
                ))
            }
        }
        serde_json::from_value(data).map_err(|e| ConvoError::InvalidSessionData(e.to_string()))
    }

    fn touch(&mut self) {
        self.metadata.last_active_at = Utc::now();
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn session_with(n: usize) -> Session {
        let mut session = Session::new();
        session.add_items((0..n).map(|i| {
            if i % 2 == 0 {
                Item::user(format!("question {i}"))
            } else {
                Item::assistant(format!("answer {i}"))
            }
        }));
        session
    }

    #[test]
    fn test_get_items_returns_copy() {
        let session = session_with(5);
        let mut items = session.get_items(None);
        items.clear();
        assert_eq!(session.item_count(), 5);

        let last_two = session.get_items(Some(2));
        assert_eq!(last_two, vec![Item::assistant("answer 3"), Item::user("question 4")]);
        assert_eq!(session.get_items(Some(50)).len(), 5);
    }

    #[test]
    fn test_pop_and_clear() {
        let mut session = session_with(2);
        session.add_metrics(MetricsDelta::tokens_used(10));

        assert_eq!(session.pop_item(), Some(Item::assistant("answer 1")));
        session.clear();
        assert_eq!(session.item_count(), 0);
        assert_eq!(session.pop_item(), None);
        assert_eq!(session.metrics().total_tokens_used, 10);
    }

    #[test]
    fn test_fork_independence() {
        let mut parent = session_with(6);
        for k in 0..6 {
            let fork = parent.fork(Some(k)).unwrap();
            assert_eq!(fork.item_count(), k + 1);
            assert_eq!(fork.parent_session_id(), Some(parent.id()));
            assert_eq!(fork.fork_at_item_index(), Some(k));
            assert_ne!(fork.id(), parent.id());
        }

        let mut fork = parent.fork(Some(2)).unwrap();
        fork.add_items([Item::user("only in fork")]);
        parent.pop_item();

        assert_eq!(parent.item_count(), 5);
        assert_eq!(fork.item_count(), 4);
        assert_eq!(fork.items()[2], Item::user("question 2"));
        assert!(!parent.items().contains(&Item::user("only in fork")));
    }

    #[test]
    fn test_fork_defaults_to_last_index_and_resets_metrics() {
        let mut parent = session_with(3);
        parent.add_metrics(MetricsDelta::tokens_used(500));

        let fork = parent.fork(None).unwrap();
        assert_eq!(fork.item_count(), 3);
        assert_eq!(fork.fork_at_item_index(), Some(2));
        assert_eq!(fork.metrics(), &SessionMetrics::default());
        assert!(fork.metadata().created_at >= parent.metadata().created_at);
    }

    #[test]
    fn test_fork_bounds() {
        let session = session_with(4);
        assert!(matches!(
            session.fork(Some(4)),
            Err(ConvoError::OutOfRange { index: 4, len: 4 })
        ));
        assert!(matches!(
            Session::new().fork(None),
            Err(ConvoError::OutOfRange { index: -1, len: 0 })
        ));
    }

    #[test]
    fn test_metrics_accumulation() {
        let mut session = Session::new();
        session.add_metrics(MetricsDelta::tokens_used(100));
        session.add_metrics(MetricsDelta::prompt_tokens(50));

        let metrics = session.metrics();
        assert_eq!(metrics.total_tokens_used, 100);
        assert_eq!(metrics.total_prompt_tokens, 50);
        assert_eq!(metrics.total_completion_tokens, 0);
        assert_eq!(metrics.execution_count, 2);
        assert_eq!(metrics.last_prompt_tokens, Some(50));
    }

    #[test]
    fn test_summary_preview() {
        let mut session = Session::new();
        assert_eq!(session.get_summary().preview, "");

        session.metadata_mut().last_summary = Some("Earlier we discussed flights".into());
        assert_eq!(session.get_summary().preview, "Earlier we discussed flights");

        session.add_items([
            Item::system("be brief"),
            Item::user("Please find me the cheapest flight from Lisbon to Tokyo in early March"),
        ]);
        session.add_tag("travel");
        session.add_tag("travel");

        let summary = session.get_summary();
        assert_eq!(summary.preview, "Please find me the cheapest flight from Lisbon to...");
        assert_eq!(summary.item_count, 2);
        assert_eq!(summary.tags, vec!["travel".to_string()]);
    }

    #[test]
    fn test_serialization_round_trip() {
        let mut parent = session_with(3);
        parent.add_items([
            Item::tool_call("c1", "calculator", json!({"expr": "2*21"})),
            Item::tool_result("c1", "calculator", json!(42)),
        ]);
        parent.add_metrics(MetricsDelta {
            tokens_used: Some(30),
            prompt_tokens: Some(20),
            completion_tokens: Some(10),
        });
        parent.set_metadata("origin", json!("cli"));
        let fork = parent.fork(Some(4)).unwrap();

        for session in [parent, fork] {
            let restored = Session::from_json(session.to_json().unwrap()).unwrap();
            assert_eq!(restored, session);
        }
    }

    #[test]
    fn test_from_json_requires_id() {
        let err = Session::from_json(json!({"items": []})).unwrap_err();
        assert!(matches!(err, ConvoError::InvalidSessionData(_)));

        let err = Session::from_json(json!({"id": "abc", "items": "nope"})).unwrap_err();
        assert!(matches!(err, ConvoError::InvalidSessionData(_)));
    }

    #[test]
    fn test_from_json_tolerates_missing_metrics() {
        let session = Session::from_json(json!({
            "id": "legacy",
            "items": [{"type": "message", "role": "user", "content": "hi"}],
            "metadata": {"createdAt": "2024-01-01T00:00:00Z", "lastActiveAt": "2024-01-01T00:00:00Z"}
        }))
        .unwrap();
        assert_eq!(session.id(), "legacy");
        assert_eq!(session.metrics(), &SessionMetrics::default());
        assert_eq!(session.parent_session_id(), None);
    }

    #[test]
    fn test_context_items_inject_summary() {
        let mut session = session_with(1);
        assert_eq!(session.context_items(), session.get_items(None));

        session.metadata_mut().merge_summary("user wants flights");
        let items = session.context_items();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].role(), Some(MessageRole::System));
        assert!(items[0].text().unwrap().contains("user wants flights"));
    }
}
