//! Echo 能力（测试用）

use async_trait::async_trait;
use serde_json::Value;

use crate::tools::{Capability, InvocationContext};

/// Echo 能力：回显文本
pub struct EchoCapability;

#[async_trait]
impl Capability for EchoCapability {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Echo text back (for testing). Args: {\"text\": \"message\"}"
    }

    fn input_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "text": { "type": "string" }
            },
            "required": ["text"]
        })
    }

    async fn invoke(&self, args: Value, _ctx: &InvocationContext) -> Result<Value, String> {
        let text = args
            .get("text")
            .and_then(|v| v.as_str())
            .ok_or_else(|| "missing text".to_string())?;
        Ok(Value::String(text.to_string()))
    }
}
