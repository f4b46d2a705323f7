use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::System => "system",
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
        }
    }
}

/// One entry in a conversation log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Item {
    Message {
        role: MessageRole,
        content: String,
    },
    #[serde(rename_all = "camelCase")]
    ToolCall {
        call_id: String,
        name: String,
        arguments: Value,
    },
    #[serde(rename_all = "camelCase")]
    ToolResult {
        call_id: String,
        name: String,
        output: Value,
    },
}

impl Item {
    pub fn user(content: impl Into<String>) -> Self {
        Self::Message {
            role: MessageRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::Message {
            role: MessageRole::Assistant,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::Message {
            role: MessageRole::System,
            content: content.into(),
        }
    }

    pub fn tool_call(call_id: impl Into<String>, name: impl Into<String>, arguments: Value) -> Self {
        Self::ToolCall {
            call_id: call_id.into(),
            name: name.into(),
            arguments,
        }
    }

    pub fn tool_result(call_id: impl Into<String>, name: impl Into<String>, output: Value) -> Self {
        Self::ToolResult {
            call_id: call_id.into(),
            name: name.into(),
            output,
        }
    }

    pub fn is_message(&self) -> bool {
        matches!(self, Item::Message { .. })
    }

    pub fn role(&self) -> Option<MessageRole> {
        match self {
            Item::Message { role, .. } => Some(*role),
            _ => None,
        }
    }

    /// Text of a message item; `None` for tool items.
    pub fn text(&self) -> Option<&str> {
        match self {
            Item::Message { content, .. } => Some(content),
            _ => None,
        }
    }

    pub fn call_id(&self) -> Option<&str> {
        match self {
            Item::ToolCall { call_id, .. } | Item::ToolResult { call_id, .. } => Some(call_id),
            Item::Message { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

/// Tool schema advertised to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDeclaration {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// Provider-neutral chunk produced by a model stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamChunk {
    Content {
        delta: String,
    },
    Thinking {
        delta: String,
    },
    FunctionCall {
        id: String,
        name: String,
        params: Value,
    },
    Done {
        finish_reason: String,
        usage: Option<TokenUsage>,
    },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelRequest {
    pub items: Vec<Item>,
    pub tools: Vec<ToolDeclaration>,
    pub system_prompt: Option<String>,
}

impl ModelRequest {
    pub fn new(items: Vec<Item>) -> Self {
        Self {
            items,
            ..Default::default()
        }
    }

    pub fn with_tools(mut self, tools: Vec<ToolDeclaration>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_system_prompt(mut self, system_prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(system_prompt.into());
        self
    }
}

pub type ChunkStream = BoxStream<'static, Result<StreamChunk>>;

#[derive(Error, Debug)]
pub enum ConvoError {
    #[error("Fork index {index} out of range for session with {len} items")]
    OutOfRange { index: i64, len: usize },

    #[error("Invalid session data: {0}")]
    InvalidSessionData(String),

    #[error("Session not found: {0}")]
    NotFound(String),

    #[error("Turn {0} was cancelled")]
    TurnCancelled(String),

    #[error("Turn {0} has already been executed")]
    TurnAlreadyExecuted(String),

    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Tool execution failed for '{tool}': {message}")]
    ToolError { tool: String, message: String },

    #[error("Model stream error: {0}")]
    ModelError(String),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Unknown error: {0}")]
    Unknown(String),
}

pub type Result<T> = std::result::Result<T, ConvoError>;

/// Streaming language-model backend.
///
/// Implementations should observe `cancel` while producing chunks; callers
/// also race the returned stream against it.
#[async_trait::async_trait]
pub trait ModelClient: Send + Sync {
    async fn stream(&self, request: ModelRequest, cancel: CancellationToken) -> Result<ChunkStream>;
}
