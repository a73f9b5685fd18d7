//! 上下文条目（Turn）
//!
//! 一次运行的对话/上下文日志由 Turn 组成；追加后不可变，插入顺序即因果顺序。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::tools::{InvocationRequest, InvocationResult, InvocationStatus};

/// 条目角色
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
    ToolResult,
}

/// 条目内容：文本或结构化 JSON
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum TurnContent {
    Text(String),
    Structured(Value),
}

impl TurnContent {
    /// 文本形式（结构化内容序列化为紧凑 JSON）
    pub fn as_text(&self) -> String {
        match self {
            TurnContent::Text(s) => s.clone(),
            TurnContent::Structured(v) => v.to_string(),
        }
    }
}

/// 单条上下文条目
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: TurnContent,
    /// tool-result 条目引用的调用 id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invocation_id: Option<String>,
    /// tool-result 条目对应的能力名
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capability: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<InvocationStatus>,
    /// assistant 条目发出的调用请求
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub invocations: Vec<InvocationRequest>,
    /// 压缩生成的摘要条目：角色为 system，但之后的压缩可以丢弃或折叠它
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub summary: bool,
    pub created_at: DateTime<Utc>,
}

impl Turn {
    fn text(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: TurnContent::Text(content.into()),
            invocation_id: None,
            capability: None,
            status: None,
            invocations: Vec::new(),
            summary: false,
            created_at: Utc::now(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::text(Role::System, content)
    }

    /// 压缩摘要条目
    pub fn summary(content: impl Into<String>) -> Self {
        Self {
            summary: true,
            ..Self::text(Role::System, content)
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::text(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::text(Role::Assistant, content)
    }

    /// 发出调用请求的 assistant 条目（content 可为空）
    pub fn assistant_with_invocations(
        content: impl Into<String>,
        invocations: Vec<InvocationRequest>,
    ) -> Self {
        Self {
            invocations,
            ..Self::text(Role::Assistant, content)
        }
    }

    /// 调用结果条目：ok 且输出为结构化 JSON 时保留结构，其它情况用文本
    pub fn tool_result(result: &InvocationResult) -> Self {
        let content = match (&result.status, &result.output) {
            (InvocationStatus::Ok, Value::Object(_)) | (InvocationStatus::Ok, Value::Array(_)) => {
                TurnContent::Structured(result.output.clone())
            }
            _ => TurnContent::Text(result.render()),
        };
        Self {
            role: Role::ToolResult,
            content,
            invocation_id: Some(result.id.clone()),
            capability: Some(result.name.clone()),
            status: Some(result.status),
            invocations: Vec::new(),
            summary: false,
            created_at: Utc::now(),
        }
    }

    pub fn text_content(&self) -> String {
        self.content.as_text()
    }

    pub fn is_system(&self) -> bool {
        self.role == Role::System
    }

    /// 压缩时必须保留的条目：system 条目，摘要除外
    pub fn is_pinned(&self) -> bool {
        self.is_system() && !self.summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_tool_result_turn_pairs_id() {
        let req = InvocationRequest::from_value("call_1", "echo", json!({"text": "hi"}));
        let turn = Turn::tool_result(&InvocationResult::ok(&req, json!("hi")));
        assert_eq!(turn.role, Role::ToolResult);
        assert_eq!(turn.invocation_id.as_deref(), Some("call_1"));
        assert_eq!(turn.capability.as_deref(), Some("echo"));
        assert_eq!(turn.text_content(), "hi");
    }

    #[test]
    fn test_structured_output_is_kept() {
        let req = InvocationRequest::from_value("call_2", "stat", json!({}));
        let turn = Turn::tool_result(&InvocationResult::ok(&req, json!({"size": 3})));
        assert!(matches!(turn.content, TurnContent::Structured(_)));
        assert_eq!(turn.text_content(), r#"{"size":3}"#);
    }

    #[test]
    fn test_serde_roundtrip_shape() {
        let turn = Turn::assistant_with_invocations(
            "",
            vec![InvocationRequest::from_value("c", "echo", json!({"text": "x"}))],
        );
        let v = serde_json::to_value(&turn).unwrap();
        assert_eq!(v["role"], "assistant");
        assert_eq!(v["invocations"][0]["name"], "echo");
    }
}
