//! 能力输入 Schema：调用前的结构校验 + 调用格式 JSON Schema 生成
//!
//! 参数校验交给 jsonschema（完整的 JSON Schema 语义，含 anyOf / $ref / additionalProperties 等），
//! 每条错误映射为一个 SchemaViolation。调用格式 Schema 由 schemars 生成，拼入 system prompt。

use std::collections::HashMap;
use std::fmt;

use schemars::{schema_for, JsonSchema};
use serde_json::Value;

/// 单条校验失败：字段路径 + 说明
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaViolation {
    pub field: String,
    pub message: String,
}

impl fmt::Display for SchemaViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.field.is_empty() {
            write!(f, "{}", self.message)
        } else {
            write!(f, "{}: {}", self.field, self.message)
        }
    }
}

/// 将多条违例合并为一条可读消息（作为 capability-error 的内容）
pub fn describe_violations(violations: &[SchemaViolation]) -> String {
    let parts: Vec<String> = violations.iter().map(|v| v.to_string()).collect();
    format!("Invalid arguments: {}", parts.join("; "))
}

/// 按 schema 校验参数；全部通过返回 Ok，否则返回所有违例
///
/// schema 本身不合法时作为一条违例返回（field 为空），调用不会执行。
pub fn validate_args(schema: &Value, args: &Value) -> Result<(), Vec<SchemaViolation>> {
    let validator = match jsonschema::validator_for(schema) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!(error = %e, "capability input schema does not compile");
            return Err(vec![SchemaViolation {
                field: String::new(),
                message: format!("invalid input schema: {e}"),
            }]);
        }
    };
    let violations: Vec<SchemaViolation> = validator
        .iter_errors(args)
        .map(|error| SchemaViolation {
            field: field_path(&error.instance_path.to_string()),
            message: error.to_string(),
        })
        .collect();
    if violations.is_empty() {
        Ok(())
    } else {
        Err(violations)
    }
}

/// JSON Pointer（"/tags/1"）转为点分路径（"tags.1"）
fn field_path(pointer: &str) -> String {
    pointer
        .trim_start_matches('/')
        .split('/')
        .map(|seg| seg.replace("~1", "/").replace("~0", "~"))
        .collect::<Vec<_>>()
        .join(".")
}

/// 调用请求格式：与 LlmPort 解析的 `{"tool": "...", "args": {...}}` 一致（仅用于 Schema 生成）
#[allow(dead_code)]
#[derive(JsonSchema)]
struct InvocationFormat {
    /// 可选调用 id；省略时由运行时生成
    pub id: Option<String>,
    /// 能力名，如 echo、terminate
    pub tool: String,
    /// 能力参数，须符合该能力的 input schema
    pub args: HashMap<String, serde_json::Value>,
}

/// 返回调用格式的 JSON Schema 字符串，可拼入 system prompt
pub fn invocation_format_schema_json() -> String {
    let schema = schema_for!(InvocationFormat);
    serde_json::to_string_pretty(&schema).unwrap_or_default()
}
