use chrono::Utc;
use convo_core::{ConvoError, Result};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use tokio::fs;
use tracing::{debug, info, warn};

use crate::compressor::{CompressionResult, ConversationCompressor};
use crate::metadata::SessionSummary;
use crate::session::Session;
use crate::storage::SessionStorage;

/// Options for a newly created session.
#[derive(Debug, Clone, Default)]
pub struct SessionConfig {
    pub tags: Vec<String>,
    pub metadata: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SortBy {
    #[default]
    LastActive,
    Created,
    ItemCount,
}

#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    pub sort_by: SortBy,
    pub limit: Option<usize>,
    pub offset: usize,
}

/// A session and the sessions forked from it.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionTreeNode {
    pub session: SessionSummary,
    pub children: Vec<SessionTreeNode>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompressionOutcome {
    pub compressed: bool,
    pub summary: Option<String>,
}

/// Manages session lifecycle: caching, persistence, forking and
/// compression on save.
///
/// The cache is owned by the manager and mutated through `&mut self`;
/// hosts sharing a manager across tasks wrap it in their own lock.
pub struct ConversationManager {
    storage: Arc<dyn SessionStorage>,
    compressor: Option<ConversationCompressor>,
    cache: HashMap<String, Session>,
}

impl ConversationManager {
    pub fn new(storage: Arc<dyn SessionStorage>) -> Self {
        Self {
            storage,
            compressor: None,
            cache: HashMap::new(),
        }
    }

    pub fn with_compressor(mut self, compressor: ConversationCompressor) -> Self {
        self.compressor = Some(compressor);
        self
    }

    pub fn compressor(&self) -> Option<&ConversationCompressor> {
        self.compressor.as_ref()
    }

    /// Create, cache and persist a new empty session.
    pub async fn create_session(&mut self, config: Option<SessionConfig>) -> Result<Session> {
        let mut session = Session::new();
        if let Some(config) = config {
            for tag in config.tags {
                session.add_tag(tag);
            }
            for (key, value) in config.metadata {
                session.set_metadata(key, value);
            }
        }

        self.storage.save(&session).await?;
        self.cache.insert(session.id().to_string(), session.clone());

        info!("Created new session: {}", session.id());
        Ok(session)
    }

    pub async fn get_session(&mut self, id: &str) -> Result<Option<Session>> {
        if let Some(session) = self.cache.get(id) {
            return Ok(Some(session.clone()));
        }

        let loaded = self.storage.load(id).await?;
        if let Some(session) = &loaded {
            debug!("Loaded session {} from storage", id);
            self.cache.insert(id.to_string(), session.clone());
        }
        Ok(loaded)
    }

    /// Persist a session, compressing its log first when the compressor
    /// says it is due.
    pub async fn save_session(&mut self, session: &mut Session) -> Result<()> {
        if let Some(compressor) = &self.compressor {
            let last_prompt_tokens = session.metrics().last_prompt_tokens;
            if compressor.should_compress(session.item_count(), last_prompt_tokens) {
                match compressor.compress_items(session.items()).await {
                    Ok(result) => {
                        apply_compression(session, result);
                    }
                    Err(e) => {
                        warn!("Compression failed for session {}, saving uncompressed: {}", session.id(), e);
                    }
                }
            }
        }

        self.storage.save(session).await?;
        self.cache.insert(session.id().to_string(), session.clone());

        debug!("Saved session {} ({} items)", session.id(), session.item_count());
        Ok(())
    }

    pub async fn delete_session(&mut self, id: &str) -> Result<()> {
        let cached = self.cache.remove(id).is_some();
        let stored = match self.storage.load(id).await {
            Ok(found) => found.is_some(),
            Err(e) => {
                warn!("Could not load session {} before deleting it: {}", id, e);
                true
            }
        };
        if !cached && !stored {
            return Err(ConvoError::NotFound(id.to_string()));
        }

        self.storage.delete(id).await?;
        info!("Deleted session {}", id);
        Ok(())
    }

    /// Write a standalone copy of a session with an export timestamp.
    pub async fn export_session(&mut self, id: &str, output_path: &Path) -> Result<()> {
        let session = self
            .get_session(id)
            .await?
            .ok_or_else(|| ConvoError::NotFound(id.to_string()))?;

        let export = serde_json::json!({
            "session": session.to_json()?,
            "exportedAt": Utc::now(),
        });

        fs::write(output_path, serde_json::to_string_pretty(&export)?).await?;

        info!("Exported session {} to {:?}", id, output_path);
        Ok(())
    }

    pub async fn fork_session(&mut self, id: &str, at_index: Option<usize>) -> Result<Session> {
        let parent = self
            .get_session(id)
            .await?
            .ok_or_else(|| ConvoError::NotFound(id.to_string()))?;

        let fork = parent.fork(at_index)?;
        self.storage.save(&fork).await?;
        self.cache.insert(fork.id().to_string(), fork.clone());

        info!(
            "Forked session {} at item {:?} into {}",
            id,
            fork.fork_at_item_index(),
            fork.id()
        );
        Ok(fork)
    }

    /// Forest of stored sessions, rooted at sessions without a (known)
    /// parent. Siblings are ordered by creation time.
    pub async fn get_session_tree(&self) -> Result<Vec<SessionTreeNode>> {
        let summaries = self.storage.list_all().await?;
        let known: HashSet<String> = summaries.iter().map(|s| s.id.clone()).collect();

        let mut roots = Vec::new();
        let mut children: HashMap<String, Vec<SessionSummary>> = HashMap::new();
        for summary in summaries {
            let parent = summary
                .parent_session_id
                .clone()
                .filter(|parent| known.contains(parent) && parent != &summary.id);
            match parent {
                Some(parent) => children.entry(parent).or_default().push(summary),
                None => roots.push(summary),
            }
        }

        roots.sort_by_key(|s| s.created_at);
        let mut forest: Vec<SessionTreeNode> = roots
            .into_iter()
            .map(|root| build_node(root, &mut children))
            .collect();

        // Parent links that form a cycle never reach a root.
        while let Some(key) = children.keys().next().cloned() {
            let group = children.remove(&key).unwrap_or_default();
            warn!("Session lineage cycle detected around {}", key);
            for summary in group {
                forest.push(build_node(summary, &mut children));
            }
        }

        Ok(forest)
    }

    pub async fn list_sessions(&self, options: ListOptions) -> Result<Vec<SessionSummary>> {
        let mut summaries = self.storage.list_all().await?;

        match options.sort_by {
            SortBy::LastActive => summaries.sort_by(|a, b| b.last_active_at.cmp(&a.last_active_at)),
            SortBy::Created => summaries.sort_by(|a, b| b.created_at.cmp(&a.created_at)),
            SortBy::ItemCount => summaries.sort_by(|a, b| b.item_count.cmp(&a.item_count)),
        }

        Ok(summaries
            .into_iter()
            .skip(options.offset)
            .take(options.limit.unwrap_or(usize::MAX))
            .collect())
    }

    /// Compress a session now, regardless of the save-time trigger.
    pub async fn compress_session(&mut self, id: &str) -> Result<CompressionOutcome> {
        let mut session = self
            .get_session(id)
            .await?
            .ok_or_else(|| ConvoError::NotFound(id.to_string()))?;

        let Some(compressor) = &self.compressor else {
            return Ok(CompressionOutcome {
                compressed: false,
                summary: None,
            });
        };

        let result = compressor.compress_items(session.items()).await?;
        let summary = result.summary.clone();
        if !apply_compression(&mut session, result) {
            return Ok(CompressionOutcome {
                compressed: false,
                summary: None,
            });
        }

        self.storage.save(&session).await?;
        self.cache.insert(session.id().to_string(), session);

        Ok(CompressionOutcome {
            compressed: true,
            summary: Some(summary),
        })
    }

    pub fn get_cache_size(&self) -> usize {
        self.cache.len()
    }

    pub fn clear_cache(&mut self) {
        self.cache.clear();
    }
}

/// Returns whether the session changed.
fn apply_compression(session: &mut Session, result: CompressionResult) -> bool {
    if result.summary.is_empty() {
        return false;
    }

    let before = session.item_count();
    session.replace_items(result.compressed_items);
    session.metadata_mut().merge_summary(&result.summary);
    session.reset_last_prompt_tokens();

    info!(
        "Compressed session {} from {} to {} items",
        session.id(),
        before,
        session.item_count()
    );
    true
}

fn build_node(
    summary: SessionSummary,
    children: &mut HashMap<String, Vec<SessionSummary>>,
) -> SessionTreeNode {
    let mut kids = children.remove(&summary.id).unwrap_or_default();
    kids.sort_by_key(|s| s.created_at);
    SessionTreeNode {
        children: kids
            .into_iter()
            .map(|kid| build_node(kid, children))
            .collect(),
        session: summary,
    }
}
