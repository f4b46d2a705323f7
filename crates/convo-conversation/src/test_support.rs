use async_trait::async_trait;
use convo_core::{ChunkStream, ConvoError, ModelClient, ModelRequest, Result, StreamChunk, TokenUsage};
use futures::stream;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

/// Summarizer stand-in that answers every request with the same text.
pub(crate) struct ScriptedModel {
    reply: std::result::Result<String, String>,
    requests: Mutex<Vec<ModelRequest>>,
}

impl ScriptedModel {
    pub(crate) fn summary(text: &str) -> Arc<Self> {
        Arc::new(Self {
            reply: Ok(text.to_string()),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn failing(message: &str) -> Arc<Self> {
        Arc::new(Self {
            reply: Err(message.to_string()),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn requests(&self) -> Vec<ModelRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub(crate) fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl ModelClient for ScriptedModel {
    async fn stream(&self, request: ModelRequest, _cancel: CancellationToken) -> Result<ChunkStream> {
        self.requests.lock().unwrap().push(request);
        match &self.reply {
            Ok(text) => {
                let chunks = vec![
                    Ok(StreamChunk::Content { delta: text.clone() }),
                    Ok(StreamChunk::Done {
                        finish_reason: "end_turn".to_string(),
                        usage: Some(TokenUsage::default()),
                    }),
                ];
                Ok(Box::pin(stream::iter(chunks)))
            }
            Err(message) => Err(ConvoError::ModelError(message.clone())),
        }
    }
}
