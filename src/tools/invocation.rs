//! 能力调用请求与结果
//!
//! Reasoning Port 产出 InvocationRequest，ToolDispatcher 为每个请求产出恰好一个 InvocationResult，
//! 结果通过 invocation id 与请求配对（并行调用时也能对上）。

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// 单次能力调用请求：{id, name, arguments}
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InvocationRequest {
    /// 单步内唯一的调用 id
    pub id: String,
    /// 能力名（注册表中的键）
    pub name: String,
    /// 参数：name -> value
    #[serde(default)]
    pub arguments: Map<String, Value>,
}

impl InvocationRequest {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: Map<String, Value>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
        }
    }

    /// 由任意 JSON 构造；非对象参数视为空参数
    pub fn from_value(id: impl Into<String>, name: impl Into<String>, arguments: Value) -> Self {
        let arguments = match arguments {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self::new(id, name, arguments)
    }

    /// 生成新的随机 id（服务端未给出 id 时使用）
    pub fn fresh_id() -> String {
        format!("call_{}", uuid::Uuid::new_v4().simple())
    }

    pub fn arguments_value(&self) -> Value {
        Value::Object(self.arguments.clone())
    }
}

/// 调用结果状态
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationStatus {
    Ok,
    CapabilityError,
    NotFound,
}

impl InvocationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvocationStatus::Ok => "ok",
            InvocationStatus::CapabilityError => "capability_error",
            InvocationStatus::NotFound => "not_found",
        }
    }
}

/// 单次调用结果：ok 时携带 output，否则携带 error
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InvocationResult {
    pub id: String,
    pub name: String,
    pub status: InvocationStatus,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub output: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl InvocationResult {
    pub fn ok(request: &InvocationRequest, output: Value) -> Self {
        Self {
            id: request.id.clone(),
            name: request.name.clone(),
            status: InvocationStatus::Ok,
            output,
            error: None,
        }
    }

    pub fn capability_error(request: &InvocationRequest, error: impl Into<String>) -> Self {
        Self {
            id: request.id.clone(),
            name: request.name.clone(),
            status: InvocationStatus::CapabilityError,
            output: Value::Null,
            error: Some(error.into()),
        }
    }

    pub fn not_found(request: &InvocationRequest) -> Self {
        Self {
            id: request.id.clone(),
            name: request.name.clone(),
            status: InvocationStatus::NotFound,
            output: Value::Null,
            error: Some(format!("Unknown capability: {}", request.name)),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == InvocationStatus::Ok
    }

    /// 供上下文与日志使用的文本形式：字符串输出原样返回，其它 JSON 序列化，失败时为 "Error: ..."
    pub fn render(&self) -> String {
        match self.status {
            InvocationStatus::Ok => match &self.output {
                Value::String(s) => s.clone(),
                Value::Null => format!("Capability `{}` completed with no output", self.name),
                other => other.to_string(),
            },
            _ => format!("Error: {}", self.error.as_deref().unwrap_or("unknown error")),
        }
    }
}
