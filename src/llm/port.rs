//! Reasoning Port：把上下文交给补全服务，得到纯文本回答或一组能力调用请求
//!
//! LlmPort 适配任意文本 LlmClient：在 system 中公布可用能力与调用格式，再解析回复。
//! 识别的回复形状：`{"tool","args","id"?}`、此类对象的数组（并行调用）、`{"tool_calls":[...]}`，
//! 可包在 ```json 代码块中；其余一律视为纯文本。

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::llm::{LlmClient, LlmError};
use crate::memory::Turn;
use crate::tools::{invocation_format_schema_json, CapabilityDescriptor, InvocationRequest};

/// 一次推理的决定
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Content(String),
    /// 调用请求（至少一个），可附带说明文本
    Invocations {
        content: Option<String>,
        requests: Vec<InvocationRequest>,
    },
}

impl Decision {
    pub fn invocations(requests: Vec<InvocationRequest>) -> Self {
        Decision::Invocations {
            content: None,
            requests,
        }
    }

    /// 单个调用（测试与脚本常用）
    pub fn call(name: &str, args: Value) -> Self {
        Self::invocations(vec![InvocationRequest::from_value(
            InvocationRequest::fresh_id(),
            name,
            args,
        )])
    }

    pub fn content_text(&self) -> Option<&str> {
        match self {
            Decision::Content(text) => Some(text),
            Decision::Invocations { content, .. } => content.as_deref(),
        }
    }
}

/// Reasoning Port
#[async_trait]
pub trait ReasoningPort: Send + Sync {
    async fn decide(
        &self,
        turns: &[Turn],
        capabilities: &[CapabilityDescriptor],
    ) -> Result<Decision, LlmError>;
}

const DEFAULT_SYSTEM_PROMPT: &str = "You are an agent that solves the user's task step by step. \
Use the available capabilities when they help; call `terminate` when the task is complete.";

/// 基于文本补全的 Reasoning Port
pub struct LlmPort {
    llm: Arc<dyn LlmClient>,
    system_prompt: String,
}

impl LlmPort {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self {
            llm,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    /// 获取 LLM 累计 token 使用统计
    pub fn token_usage(&self) -> (u64, u64, u64) {
        self.llm.token_usage()
    }

    /// 拼接能力公告：名称 / 描述 / 输入 schema，以及调用格式
    pub fn capability_prompt(&self, capabilities: &[CapabilityDescriptor]) -> String {
        if capabilities.is_empty() {
            return self.system_prompt.clone();
        }
        let listing = serde_json::to_string_pretty(capabilities).unwrap_or_else(|_| "[]".to_string());
        format!(
            "{}\n\n## Available capabilities\n{}\n\n## Invocation format\n\
Reply with JSON matching this schema to invoke a capability. \
Use a JSON array of such objects to invoke several at once.\n{}\n\
Reply with plain text when no invocation is needed.",
            self.system_prompt,
            listing,
            invocation_format_schema_json()
        )
    }
}

#[async_trait]
impl ReasoningPort for LlmPort {
    async fn decide(
        &self,
        turns: &[Turn],
        capabilities: &[CapabilityDescriptor],
    ) -> Result<Decision, LlmError> {
        let mut prompt = Vec::with_capacity(turns.len() + 1);
        prompt.push(Turn::system(self.capability_prompt(capabilities)));
        prompt.extend_from_slice(turns);

        let reply = self.llm.complete(&prompt).await.map_err(|e| match e {
            LlmError::Request(msg) => classify_service_error(msg),
            other => other,
        })?;
        parse_decision(&reply)
    }
}

/// 服务错误归类：提示上下文长度超限的消息 → ContextOverflow
pub fn classify_service_error(message: String) -> LlmError {
    let lower = message.to_lowercase();
    if lower.contains("context_length_exceeded")
        || lower.contains("maximum context length")
        || lower.contains("context window")
    {
        LlmError::ContextOverflow(message)
    } else {
        LlmError::Request(message)
    }
}

/// 解析模型回复
pub fn parse_decision(output: &str) -> Result<Decision, LlmError> {
    let trimmed = output.trim();

    let (json_str, prose, fenced) = if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + 7..];
        let body = rest.find("```").map(|end| rest[..end].trim()).unwrap_or(rest.trim());
        (body, trimmed[..start].trim(), true)
    } else if trimmed.starts_with('{') || trimmed.starts_with('[') {
        (trimmed, "", false)
    } else {
        return Ok(Decision::Content(trimmed.to_string()));
    };

    let value: Value = match serde_json::from_str(json_str) {
        Ok(v) => v,
        // 无围栏且不像调用的文本（如 "[1] First, ..."）按普通回答处理
        Err(_) if !fenced && !looks_like_invocation(json_str) => {
            return Ok(Decision::Content(trimmed.to_string()));
        }
        Err(e) => return Err(LlmError::Protocol(format!("{}: {}", e, json_str))),
    };

    let (entries, inline_content) = match value {
        Value::Array(items) if items.iter().any(Value::is_object) => (items, None),
        Value::Array(_) => return Ok(Decision::Content(trimmed.to_string())),
        Value::Object(mut obj) => {
            if let Some(calls) = obj.remove("tool_calls") {
                let Value::Array(items) = calls else {
                    return Err(LlmError::Protocol("`tool_calls` must be an array".to_string()));
                };
                let content = obj.get("content").and_then(Value::as_str).map(String::from);
                (items, content)
            } else if obj.contains_key("tool") {
                (vec![Value::Object(obj)], None)
            } else {
                // 普通 JSON 回答，不是调用
                return Ok(Decision::Content(trimmed.to_string()));
            }
        }
        _ => return Ok(Decision::Content(trimmed.to_string())),
    };

    let mut seen = HashSet::new();
    let mut requests = Vec::with_capacity(entries.len());
    for entry in entries {
        let mut request = parse_entry(entry)?;
        if !seen.insert(request.id.clone()) {
            request.id = InvocationRequest::fresh_id();
            seen.insert(request.id.clone());
        }
        requests.push(request);
    }

    if requests.is_empty() {
        return Ok(Decision::Content(inline_content.unwrap_or_default()));
    }

    let content = inline_content.or_else(|| (!prose.is_empty()).then(|| prose.to_string()));
    Ok(Decision::Invocations { content, requests })
}

fn looks_like_invocation(text: &str) -> bool {
    text.contains("\"tool\"") || text.contains("\"tool_calls\"")
}

fn parse_entry(entry: Value) -> Result<InvocationRequest, LlmError> {
    let mut obj = match entry {
        Value::Object(obj) => obj,
        other => {
            return Err(LlmError::Protocol(format!("invocation must be an object: {}", other)))
        }
    };
    let name = match obj.remove("tool") {
        Some(Value::String(name)) if !name.trim().is_empty() => name,
        _ => return Err(LlmError::Protocol("invocation without a `tool` name".to_string())),
    };
    let arguments = match obj.remove("args") {
        Some(Value::Object(map)) => map,
        None | Some(Value::Null) => Map::new(),
        Some(other) => {
            return Err(LlmError::Protocol(format!("`args` of `{}` must be an object, got {}", name, other)))
        }
    };
    let id = obj
        .remove("id")
        .and_then(|v| v.as_str().map(String::from))
        .filter(|id| !id.is_empty())
        .unwrap_or_else(InvocationRequest::fresh_id);
    Ok(InvocationRequest::new(id, name, arguments))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_plain_text_is_content() {
        let d = parse_decision("The answer is 42.").unwrap();
        assert_eq!(d, Decision::Content("The answer is 42.".to_string()));
    }

    #[test]
    fn test_single_call() {
        let d = parse_decision(r#"{"tool": "echo", "args": {"text": "hi"}, "id": "c1"}"#).unwrap();
        match d {
            Decision::Invocations { content, requests } => {
                assert!(content.is_none());
                assert_eq!(requests.len(), 1);
                assert_eq!(requests[0].id, "c1");
                assert_eq!(requests[0].name, "echo");
                assert_eq!(requests[0].arguments_value(), json!({"text": "hi"}));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_array_assigns_unique_ids() {
        let d = parse_decision(
            r#"[{"tool": "foo", "args": {}}, {"tool": "echo", "args": {"text": "hi"}, "id": "x"}, {"tool": "echo", "id": "x"}]"#,
        )
        .unwrap();
        let Decision::Invocations { requests, .. } = d else { panic!("expected invocations") };
        assert_eq!(requests.len(), 3);
        assert!(requests[0].id.starts_with("call_"));
        assert_eq!(requests[1].id, "x");
        assert_ne!(requests[2].id, "x");
    }

    #[test]
    fn test_fenced_block_with_prose() {
        let text = "Let me check.\n```json\n{\"tool_calls\": [{\"tool\": \"echo\", \"args\": {\"text\": \"a\"}}]}\n```";
        let d = parse_decision(text).unwrap();
        assert_eq!(d.content_text(), Some("Let me check."));
    }

    #[test]
    fn test_malformed_json_is_protocol_error() {
        let err = parse_decision(r#"{"tool": "echo", "args": "#).unwrap_err();
        assert!(matches!(err, LlmError::Protocol(_)));
    }

    #[test]
    fn test_bracketed_prose_is_content() {
        let text = "[1] First, the capital of France is Paris.";
        assert_eq!(parse_decision(text).unwrap(), Decision::Content(text.to_string()));
        let note = "{Note} the answer is below";
        assert!(matches!(parse_decision(note).unwrap(), Decision::Content(_)));
        let numbers = "[1, 2, 3]";
        assert!(matches!(parse_decision(numbers).unwrap(), Decision::Content(_)));
    }

    #[test]
    fn test_malformed_fenced_json_is_protocol_error() {
        let err = parse_decision("```json\n[1] not json\n```").unwrap_err();
        assert!(matches!(err, LlmError::Protocol(_)));
    }

    #[test]
    fn test_missing_tool_name_is_protocol_error() {
        let err = parse_decision(r#"[{"args": {}}]"#).unwrap_err();
        assert!(matches!(err, LlmError::Protocol(_)));
    }

    #[test]
    fn test_json_without_tool_is_content() {
        let d = parse_decision(r#"{"answer": 42}"#).unwrap();
        assert!(matches!(d, Decision::Content(_)));
    }

    #[test]
    fn test_classify_overflow() {
        assert!(matches!(
            classify_service_error("This model's maximum context length is 8192 tokens".into()),
            LlmError::ContextOverflow(_)
        ));
        assert!(matches!(classify_service_error("502 bad gateway".into()), LlmError::Request(_)));
    }

    struct CannedClient(String);

    #[async_trait]
    impl LlmClient for CannedClient {
        async fn complete(&self, turns: &[Turn]) -> Result<String, LlmError> {
            assert!(turns[0].is_system());
            assert!(turns[0].text_content().contains("\"echo\""));
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn test_port_advertises_capabilities() {
        let registry = crate::tools::CapabilityRegistry::builder()
            .register(crate::tools::EchoCapability)
            .build();
        let port = LlmPort::new(Arc::new(CannedClient(r#"{"tool":"echo","args":{"text":"hi"}}"#.into())));
        let d = port
            .decide(&[Turn::user("say hi")], registry.descriptors())
            .await
            .unwrap();
        assert!(matches!(d, Decision::Invocations { .. }));
    }
}
