//! Terminate 能力：模型认为任务完成（或无法继续）时调用，StepEngine 据此结束本次运行

use async_trait::async_trait;
use serde_json::Value;

use crate::tools::{Capability, InvocationContext};

/// 默认的终止能力名
pub const TERMINATE: &str = "terminate";

pub struct TerminateCapability;

#[async_trait]
impl Capability for TerminateCapability {
    fn name(&self) -> &str {
        TERMINATE
    }

    fn description(&self) -> &str {
        "Terminate the interaction when the request is met OR if you cannot proceed further. \
         Args: {\"status\": \"success\" | \"failure\"}"
    }

    fn input_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "status": {
                    "type": "string",
                    "enum": ["success", "failure"]
                }
            },
            "required": ["status"]
        })
    }

    async fn invoke(&self, args: Value, _ctx: &InvocationContext) -> Result<Value, String> {
        let status = args.get("status").and_then(|v| v.as_str()).unwrap_or("success");
        Ok(Value::String(format!(
            "The interaction has been completed with status: {status}"
        )))
    }
}
