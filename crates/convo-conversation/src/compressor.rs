use convo_config::CompressorConfig;
use convo_core::{Item, MessageRole, ModelClient, ModelRequest, Result, StreamChunk};
use futures::StreamExt;
use std::collections::HashSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct CompressionResult {
    /// Empty when nothing was summarized.
    pub summary: String,
    pub compressed_items: Vec<Item>,
}

impl CompressionResult {
    fn unchanged(items: &[Item]) -> Self {
        Self {
            summary: String::new(),
            compressed_items: items.to_vec(),
        }
    }
}

/// Decides when a log is too large and replaces its older part with a
/// model-written summary.
pub struct ConversationCompressor {
    config: CompressorConfig,
    model: Arc<dyn ModelClient>,
}

impl ConversationCompressor {
    pub fn new(config: CompressorConfig, model: Arc<dyn ModelClient>) -> Self {
        Self { config, model }
    }

    pub fn config(&self) -> &CompressorConfig {
        &self.config
    }

    /// The token watermark wins when both it and a prompt size are known;
    /// otherwise the item count decides.
    pub fn should_compress(&self, item_count: usize, last_prompt_tokens: Option<u64>) -> bool {
        match (self.config.token_watermark, last_prompt_tokens) {
            (Some(watermark), Some(tokens)) => tokens > watermark,
            _ => item_count > self.config.summarize_after_items,
        }
    }

    pub async fn compress_items(&self, items: &[Item]) -> Result<CompressionResult> {
        if items.len() <= self.config.summarize_after_items {
            return Ok(CompressionResult::unchanged(items));
        }

        let start = self.tail_start(items);
        if start == 0 {
            debug!("Protected tail covers all {} items, skipping compression", items.len());
            return Ok(CompressionResult::unchanged(items));
        }

        let (head, tail) = items.split_at(start);
        let transcript = transcript(head);
        if transcript.is_empty() {
            debug!("No message text in the {} oldest items, skipping compression", head.len());
            return Ok(CompressionResult::unchanged(items));
        }

        let summary = self.summarize(transcript).await?;
        if summary.is_empty() {
            warn!("Summarizer returned no text, keeping history uncompressed");
            return Ok(CompressionResult::unchanged(items));
        }

        info!(
            "Compressed {} items into a {}-char summary, kept {} recent items",
            head.len(),
            summary.len(),
            tail.len()
        );

        Ok(CompressionResult {
            summary,
            compressed_items: tail.to_vec(),
        })
    }

    /// Index of the first item that must be kept verbatim.
    pub fn tail_start(&self, items: &[Item]) -> usize {
        match self.config.protect_recent_messages {
            Some(count) => protected_tail_start(items, count),
            None => items.len().saturating_sub(self.config.keep_recent_items),
        }
    }

    async fn summarize(&self, transcript: String) -> Result<String> {
        let instruction = format!(
            "Summarize the following conversation in under {} characters. \
             Keep facts, decisions, user preferences and unfinished tasks. \
             Reply with the summary only.",
            self.config.max_summary_length
        );
        let request = ModelRequest::new(vec![Item::user(transcript)]).with_system_prompt(instruction);

        let mut stream = self.model.stream(request, CancellationToken::new()).await?;
        let mut summary = String::new();
        while let Some(chunk) = stream.next().await {
            if let StreamChunk::Content { delta } = chunk? {
                summary.push_str(&delta);
            }
        }

        Ok(summary.trim().to_string())
    }
}

/// `role: text` lines for the message items; tool items are left out.
fn transcript(items: &[Item]) -> String {
    items
        .iter()
        .filter_map(|item| match item {
            Item::Message { role, content } => Some(format!("{}: {}", role.as_str(), content)),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Start of the tail holding the `count` most recent messages, widened so
/// that no tool-call/tool-result pair straddles the boundary.
fn protected_tail_start(items: &[Item], count: usize) -> usize {
    let mut boundary = if count == 0 {
        items.len()
    } else {
        items
            .iter()
            .enumerate()
            .rev()
            .filter(|(_, item)| item.is_message())
            .nth(count - 1)
            .map(|(index, _)| index)
            .unwrap_or(0)
    };

    while boundary > 0 && !items[boundary - 1].is_message() {
        boundary -= 1;
    }

    loop {
        let before = boundary;

        let tail_ids: HashSet<&str> = items[boundary..].iter().filter_map(Item::call_id).collect();
        if let Some(first) = items[..boundary]
            .iter()
            .position(|item| item.call_id().is_some_and(|id| tail_ids.contains(id)))
        {
            boundary = first;
        }

        // A tail opening with a tool item also keeps the assistant turn that
        // issued it.
        if boundary < items.len() && !items[boundary].is_message() {
            for index in (0..boundary).rev() {
                match items[index].role() {
                    Some(MessageRole::Assistant) => {
                        boundary = index;
                        break;
                    }
                    Some(_) => break,
                    None => {}
                }
            }
        }

        if boundary == before {
            return boundary;
        }
    }
}
