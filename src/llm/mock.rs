//! Mock 后端（用于测试与离线运行，无需 API）
//!
//! - MockLlmClient：文本客户端。先把用户最后一条消息交给 echo，看到观察结果后调用 terminate。
//! - ScriptedPort：直接实现 ReasoningPort，按顺序回放预设的决定或错误，并记录每次看到的上下文。

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use crate::llm::{Decision, LlmClient, LlmError, ReasoningPort};
use crate::memory::{Role, Turn};
use crate::tools::{CapabilityDescriptor, TERMINATE};

/// Mock 客户端：echo 一次，然后 terminate
#[derive(Debug, Default)]
pub struct MockLlmClient;

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, turns: &[Turn]) -> Result<String, LlmError> {
        if let Some(observation) = turns.last().filter(|t| t.role == Role::ToolResult) {
            return Ok(json!({
                "tool_calls": [{ "tool": TERMINATE, "args": { "status": "success" } }],
                "content": observation.text_content(),
            })
            .to_string());
        }

        let last_user = turns
            .iter()
            .rev()
            .find(|t| t.role == Role::User)
            .map(|t| t.text_content())
            .unwrap_or_else(|| "(no input)".to_string());

        Ok(json!({ "tool": "echo", "args": { "text": last_user } }).to_string())
    }
}

/// 脚本耗尽后的行为
#[derive(Debug, Clone)]
pub enum ScriptFallback {
    /// 回答固定文本
    Content(String),
    /// 反复给出同一个决定
    Repeat(Decision),
}

/// 回放式 Reasoning Port
pub struct ScriptedPort {
    script: Mutex<VecDeque<Result<Decision, LlmError>>>,
    fallback: ScriptFallback,
    delay: Option<Duration>,
    seen: Mutex<Vec<Vec<Turn>>>,
}

impl ScriptedPort {
    pub fn new(script: Vec<Result<Decision, LlmError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            fallback: ScriptFallback::Content("done".to_string()),
            delay: None,
            seen: Mutex::new(Vec::new()),
        }
    }

    /// 永远给出同一个决定
    pub fn repeating(decision: Decision) -> Self {
        Self::new(Vec::new()).with_fallback(ScriptFallback::Repeat(decision))
    }

    pub fn with_fallback(mut self, fallback: ScriptFallback) -> Self {
        self.fallback = fallback;
        self
    }

    /// 每次 decide 前等待，用于模拟慢服务
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.seen.lock().map(|s| s.len()).unwrap_or(0)
    }

    /// 第 n 次调用时看到的上下文
    pub fn seen(&self, n: usize) -> Option<Vec<Turn>> {
        self.seen.lock().ok().and_then(|s| s.get(n).cloned())
    }
}

#[async_trait]
impl ReasoningPort for ScriptedPort {
    async fn decide(
        &self,
        turns: &[Turn],
        _capabilities: &[CapabilityDescriptor],
    ) -> Result<Decision, LlmError> {
        if let Ok(mut seen) = self.seen.lock() {
            seen.push(turns.to_vec());
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let next = self.script.lock().ok().and_then(|mut q| q.pop_front());
        match next {
            Some(step) => step,
            None => Ok(match &self.fallback {
                ScriptFallback::Content(text) => Decision::Content(text.clone()),
                ScriptFallback::Repeat(decision) => decision.clone(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::parse_decision;
    use crate::tools::{InvocationRequest, InvocationResult};

    #[tokio::test]
    async fn test_mock_echoes_then_terminates() {
        let client = MockLlmClient;
        let first = client.complete(&[Turn::user("hi")]).await.unwrap();
        let Decision::Invocations { requests, .. } = parse_decision(&first).unwrap() else {
            panic!("expected invocation");
        };
        assert_eq!(requests[0].name, "echo");
        assert_eq!(requests[0].arguments_value()["text"], "hi");

        let observed = Turn::tool_result(&InvocationResult::ok(&requests[0], json!("hi")));
        let second = client.complete(&[Turn::user("hi"), observed]).await.unwrap();
        let decision = parse_decision(&second).unwrap();
        assert_eq!(decision.content_text(), Some("hi"));
        let Decision::Invocations { requests, .. } = decision else { panic!() };
        assert_eq!(requests[0].name, TERMINATE);
    }

    #[tokio::test]
    async fn test_scripted_port_replays_then_falls_back() {
        let port = ScriptedPort::new(vec![
            Err(LlmError::ContextOverflow("big".into())),
            Ok(Decision::invocations(vec![InvocationRequest::from_value("1", "echo", json!({}))])),
        ]);
        assert!(port.decide(&[], &[]).await.is_err());
        assert!(matches!(port.decide(&[], &[]).await.unwrap(), Decision::Invocations { .. }));
        assert_eq!(port.decide(&[Turn::user("x")], &[]).await.unwrap(), Decision::Content("done".into()));
        assert_eq!(port.calls(), 3);
        assert_eq!(port.seen(2).unwrap().len(), 1);
    }
}
