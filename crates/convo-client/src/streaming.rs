use aws_sdk_bedrockruntime::types::ConverseStreamOutput;
use convo_core::{ConvoError, Result, StreamChunk, TokenUsage};
use serde_json::Value;
use tracing::debug;

const DEFAULT_FINISH_REASON: &str = "end_turn";

#[derive(Debug)]
struct PendingToolUse {
    id: String,
    name: String,
    input: String,
}

/// Turns Converse stream events into provider-neutral chunks.
///
/// Tool-use input arrives as JSON fragments and is emitted as a single
/// `FunctionCall` when its content block stops. `Done` is emitted once, on
/// the metadata event or when the stream ends without one.
#[derive(Debug, Default)]
pub(crate) struct StreamNormalizer {
    tool: Option<PendingToolUse>,
    stop_reason: Option<String>,
    done: bool,
}

impl StreamNormalizer {
    pub fn handle(&mut self, event: ConverseStreamOutput) -> Result<Vec<StreamChunk>> {
        match event {
            ConverseStreamOutput::ContentBlockDelta(delta) => {
                if let Some(delta) = delta.delta() {
                    if let Ok(text) = delta.as_text() {
                        return Ok(self.text(text));
                    } else if let Ok(tool_use) = delta.as_tool_use() {
                        self.tool_input(tool_use.input());
                    }
                }
                Ok(Vec::new())
            }
            ConverseStreamOutput::ContentBlockStart(start) => {
                if let Some(start) = start.start() {
                    if let Ok(tool_use) = start.as_tool_use() {
                        self.tool_start(tool_use.tool_use_id(), tool_use.name());
                    }
                }
                Ok(Vec::new())
            }
            ConverseStreamOutput::ContentBlockStop(_) => self.block_stop(),
            ConverseStreamOutput::MessageStop(stop) => {
                self.message_stop(stop.stop_reason().as_str());
                Ok(Vec::new())
            }
            ConverseStreamOutput::Metadata(metadata) => {
                let usage = metadata.usage().map(|usage| {
                    token_usage(usage.input_tokens(), usage.output_tokens(), usage.total_tokens())
                });
                Ok(self.done(usage).into_iter().collect())
            }
            other => {
                debug!("Ignoring stream event: {:?}", other);
                Ok(Vec::new())
            }
        }
    }

    /// `Done` for a stream that ended before its metadata event.
    pub fn finish(&mut self) -> Option<StreamChunk> {
        self.done(None)
    }

    fn text(&mut self, text: &str) -> Vec<StreamChunk> {
        if text.is_empty() {
            return Vec::new();
        }
        vec![StreamChunk::Content {
            delta: text.to_string(),
        }]
    }

    fn tool_start(&mut self, id: &str, name: &str) {
        debug!("Tool start detected: {} ({})", name, id);
        self.tool = Some(PendingToolUse {
            id: id.to_string(),
            name: name.to_string(),
            input: String::new(),
        });
    }

    fn tool_input(&mut self, fragment: &str) {
        match self.tool.as_mut() {
            Some(tool) => tool.input.push_str(fragment),
            None => debug!("Tool input without an open tool block"),
        }
    }

    fn block_stop(&mut self) -> Result<Vec<StreamChunk>> {
        let Some(tool) = self.tool.take() else {
            return Ok(Vec::new());
        };

        let params = if tool.input.trim().is_empty() {
            Value::Object(serde_json::Map::new())
        } else {
            serde_json::from_str(&tool.input).map_err(|e| {
                ConvoError::ModelError(format!("Tool input JSON parsing error for '{}': {e}", tool.name))
            })?
        };

        Ok(vec![StreamChunk::FunctionCall {
            id: tool.id,
            name: tool.name,
            params,
        }])
    }

    fn message_stop(&mut self, reason: &str) {
        debug!("Streaming completed with stop reason: {}", reason);
        self.stop_reason = Some(reason.to_string());
    }

    fn done(&mut self, usage: Option<TokenUsage>) -> Option<StreamChunk> {
        if self.done {
            return None;
        }
        self.done = true;
        Some(StreamChunk::Done {
            finish_reason: self
                .stop_reason
                .clone()
                .unwrap_or_else(|| DEFAULT_FINISH_REASON.to_string()),
            usage,
        })
    }
}

fn token_usage(input: i32, output: i32, total: i32) -> TokenUsage {
    let count = |n: i32| u64::try_from(n).unwrap_or(0);
    TokenUsage {
        prompt_tokens: count(input),
        completion_tokens: count(output),
        total_tokens: count(total),
    }
}
