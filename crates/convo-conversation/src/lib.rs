pub mod compressor;
pub mod manager;
pub mod metadata;
pub mod session;
pub mod storage;

pub use compressor::{CompressionResult, ConversationCompressor};
pub use manager::{
    CompressionOutcome, ConversationManager, ListOptions, SessionConfig, SessionTreeNode, SortBy,
};
pub use metadata::{MetricsDelta, SessionMetadata, SessionMetrics, SessionSummary};
pub use session::Session;
pub use storage::{FileStorage, MemoryStorage, SessionStorage};

#[cfg(test)]
mod test_support;
