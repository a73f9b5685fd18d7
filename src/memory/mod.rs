//! 记忆层：上下文条目、上下文存储（追加 / 快照 / 压缩）、大小度量、运行记录持久化

pub mod context_store;
pub mod conversation;
pub mod persistence;
pub mod token_budget;

pub use context_store::{
    CompressionReport, ContextStore, MarkerSummarizer, NoSummarizer, Summarizer,
};
pub use conversation::{Role, Turn, TurnContent};
pub use persistence::{JsonFileSink, NoopSink, Transcript, TranscriptSink};
pub use token_budget::{char_size, token_size, SizeFn, TokenEstimator};
