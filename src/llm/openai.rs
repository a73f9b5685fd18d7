//! OpenAI 兼容 API 客户端
//!
//! 通过 async_openai 调用任意 OpenAI 兼容端点（可配置 base_url）；支持 DeepSeek、OpenAI、自建代理等。
//! tool-result 条目以 user 消息的形式回传（"Observation from ..."），调用格式由 LlmPort 在 system 中约定。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_openai::config::OpenAIConfig;
use async_openai::error::OpenAIError;
use async_openai::types::chat::{
    ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
    ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
    CreateChatCompletionRequestArgs,
};
use async_openai::Client;
use async_trait::async_trait;
use serde_json::json;

use crate::llm::{classify_service_error, LlmClient, LlmError};
use crate::memory::{Role, Turn};

/// Token 使用统计（累计值）
#[derive(Debug, Clone, Default)]
pub struct TokenUsage {
    pub prompt_tokens: Arc<AtomicU64>,
    pub completion_tokens: Arc<AtomicU64>,
    pub total_tokens: Arc<AtomicU64>,
}

impl TokenUsage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, prompt: u64, completion: u64) {
        self.prompt_tokens.fetch_add(prompt, Ordering::Relaxed);
        self.completion_tokens.fetch_add(completion, Ordering::Relaxed);
        self.total_tokens.fetch_add(prompt + completion, Ordering::Relaxed);
    }

    pub fn get(&self) -> (u64, u64, u64) {
        (
            self.prompt_tokens.load(Ordering::Relaxed),
            self.completion_tokens.load(Ordering::Relaxed),
            self.total_tokens.load(Ordering::Relaxed),
        )
    }
}

/// OpenAI 兼容客户端：持有 Client、model 名与请求超时
pub struct OpenAiClient {
    client: Client<OpenAIConfig>,
    model: String,
    request_timeout: Duration,
    /// 累计 token 使用统计
    pub usage: TokenUsage,
}

impl OpenAiClient {
    pub fn new(base_url: Option<&str>, model: &str, api_key: Option<&str>) -> Self {
        let api_key = api_key
            .map(String::from)
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .unwrap_or_else(|| "sk-placeholder".to_string());

        let config = if let Some(url) = base_url {
            OpenAIConfig::new().with_api_base(url).with_api_key(api_key)
        } else {
            OpenAIConfig::new().with_api_key(api_key)
        };

        Self {
            client: Client::with_config(config),
            model: model.to_string(),
            request_timeout: Duration::from_secs(60),
            usage: TokenUsage::new(),
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    fn to_openai_messages(turns: &[Turn]) -> Result<Vec<ChatCompletionRequestMessage>, LlmError> {
        turns
            .iter()
            .map(|t| -> Result<ChatCompletionRequestMessage, LlmError> {
                let message = match t.role {
                    Role::System => ChatCompletionRequestMessage::System(
                        ChatCompletionRequestSystemMessageArgs::default()
                            .content(t.text_content())
                            .build()
                            .map_err(build_error)?,
                    ),
                    Role::User => ChatCompletionRequestMessage::User(
                        ChatCompletionRequestUserMessageArgs::default()
                            .content(t.text_content())
                            .build()
                            .map_err(build_error)?,
                    ),
                    Role::ToolResult => ChatCompletionRequestMessage::User(
                        ChatCompletionRequestUserMessageArgs::default()
                            .content(observation_text(t))
                            .build()
                            .map_err(build_error)?,
                    ),
                    Role::Assistant => ChatCompletionRequestMessage::Assistant(
                        ChatCompletionRequestAssistantMessageArgs::default()
                            .content(assistant_text(t))
                            .build()
                            .map_err(build_error)?,
                    ),
                };
                Ok(message)
            })
            .collect()
    }
}

fn build_error(e: impl std::fmt::Display) -> LlmError {
    LlmError::Request(format!("failed to build request: {}", e))
}

fn observation_text(turn: &Turn) -> String {
    format!(
        "Observation from {} [{}]: {}",
        turn.capability.as_deref().unwrap_or("capability"),
        turn.invocation_id.as_deref().unwrap_or("-"),
        turn.text_content()
    )
}

/// 发出调用的 assistant 条目按调用格式回写，模型才能看到自己做过什么
fn assistant_text(turn: &Turn) -> String {
    if turn.invocations.is_empty() {
        return turn.text_content();
    }
    let calls: Vec<_> = turn
        .invocations
        .iter()
        .map(|r| json!({ "id": r.id, "tool": r.name, "args": r.arguments_value() }))
        .collect();
    json!({ "tool_calls": calls, "content": turn.text_content() }).to_string()
}

/// 服务端错误归类：先按消息判断上下文超限，再按 API 错误码判断限流
///
/// 只看错误码而不在消息里找 "429"，超限消息中的 token 数（如 14290）不会被误判为限流。
fn map_service_error(code: Option<&str>, message: String) -> LlmError {
    let overflow = code == Some("context_length_exceeded");
    match classify_service_error(message) {
        LlmError::Request(message) if overflow => LlmError::ContextOverflow(message),
        LlmError::Request(_) if matches!(code, Some("rate_limit_exceeded")) => {
            LlmError::RateLimited {
                retry_after_ms: 1000,
            }
        }
        other => other,
    }
}

fn map_openai_error(error: OpenAIError) -> LlmError {
    match error {
        OpenAIError::ApiError(api) => map_service_error(api.code.as_deref(), api.message),
        other => map_service_error(None, other.to_string()),
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    fn token_usage(&self) -> (u64, u64, u64) {
        self.usage.get()
    }

    async fn complete(&self, turns: &[Turn]) -> Result<String, LlmError> {
        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages(Self::to_openai_messages(turns)?)
            .build()
            .map_err(build_error)?;

        let response = tokio::time::timeout(self.request_timeout, self.client.chat().create(request))
            .await
            .map_err(|_| {
                LlmError::Request(format!(
                    "request timed out after {}s",
                    self.request_timeout.as_secs()
                ))
            })?
            .map_err(map_openai_error)?;

        // 提取 token 使用统计
        if let Some(usage) = &response.usage {
            self.usage
                .add(usage.prompt_tokens as u64, usage.completion_tokens as u64);
        }

        let content = response
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .unwrap_or_default();

        Ok(content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::{InvocationRequest, InvocationResult};

    #[test]
    fn test_messages_cover_all_roles() {
        let req = InvocationRequest::from_value("c1", "echo", json!({"text": "hi"}));
        let turns = vec![
            Turn::system("sys"),
            Turn::user("hi"),
            Turn::assistant_with_invocations("", vec![req.clone()]),
            Turn::tool_result(&InvocationResult::ok(&req, json!("hi"))),
        ];
        let messages = OpenAiClient::to_openai_messages(&turns).unwrap();
        assert_eq!(messages.len(), 4);
        assert!(matches!(messages[3], ChatCompletionRequestMessage::User(_)));
    }

    #[test]
    fn test_observation_and_assistant_text() {
        let req = InvocationRequest::from_value("c1", "echo", json!({"text": "hi"}));
        let obs = Turn::tool_result(&InvocationResult::ok(&req, json!("hi")));
        assert_eq!(observation_text(&obs), "Observation from echo [c1]: hi");

        let asst = Turn::assistant_with_invocations("", vec![req]);
        let v: serde_json::Value = serde_json::from_str(&assistant_text(&asst)).unwrap();
        assert_eq!(v["tool_calls"][0]["tool"], "echo");
    }

    #[test]
    fn test_error_mapping() {
        assert!(matches!(
            map_service_error(None, "Error code: 400 context_length_exceeded".into()),
            LlmError::ContextOverflow(_)
        ));
        assert!(matches!(
            map_service_error(Some("rate_limit_exceeded"), "Rate limit reached for requests".into()),
            LlmError::RateLimited { .. }
        ));
        assert!(matches!(map_service_error(None, "boom".into()), LlmError::Request(_)));
    }

    #[test]
    fn test_overflow_with_429_in_token_count_is_not_rate_limited() {
        let message = "This model's maximum context length is 8192 tokens. \
                       However, your messages resulted in 14290 tokens.";
        assert!(matches!(
            map_service_error(None, message.to_string()),
            LlmError::ContextOverflow(_)
        ));
        assert!(matches!(
            map_service_error(Some("context_length_exceeded"), "too long".into()),
            LlmError::ContextOverflow(_)
        ));
        assert!(matches!(
            map_service_error(None, "upstream returned 429 bytes".into()),
            LlmError::Request(_)
        ));
    }
}
