//! LLM 层：文本客户端抽象与实现（OpenAI 兼容 / Mock），以及面向 Step Engine 的 Reasoning Port

pub mod mock;
pub mod openai;
pub mod port;
pub mod traits;

pub use mock::{MockLlmClient, ScriptFallback, ScriptedPort};
pub use openai::{OpenAiClient, TokenUsage};
pub use port::{classify_service_error, parse_decision, Decision, LlmPort, ReasoningPort};
pub use traits::{LlmClient, LlmError, RetryConfig, RetryingLlmClient};
