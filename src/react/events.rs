//! 运行过程事件：用于流式展示推理、能力调用、观察结果与恢复动作

use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;

use crate::core::{FailureClass, RunStatus};
use crate::tools::InvocationStatus;

/// 单步过程事件（可序列化为 JSON 供前端展示）
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    /// 开始第几步
    StepStarted { step: usize, max_steps: usize },
    /// Reasoning Port 的决定：说明文本与请求的能力名
    Decision {
        content: Option<String>,
        invocations: Vec<String>,
    },
    /// 调用能力
    Invocation {
        id: String,
        capability: String,
        args: serde_json::Value,
    },
    /// 调用结果（预览，避免过长）
    Observation {
        id: String,
        capability: String,
        status: InvocationStatus,
        preview: String,
    },
    /// 错误恢复动作（压缩后重试等）
    Recovery { action: String, detail: String },
    /// 运行结束
    Finished { status: RunStatus, step_count: usize },
    /// 错误
    Error {
        class: FailureClass,
        text: String,
    },
}

/// 发送事件；接收端已关闭时静默忽略
pub(crate) fn send_event(tx: Option<&UnboundedSender<RunEvent>>, ev: RunEvent) {
    if let Some(t) = tx {
        let _ = t.send(ev);
    }
}

/// 截取前 max_chars 个字符作为预览
pub(crate) fn preview(text: &str, max_chars: usize) -> String {
    if text.chars().count() > max_chars {
        format!("{}...", text.chars().take(max_chars).collect::<String>())
    } else {
        text.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_json_shape() {
        let ev = RunEvent::StepStarted { step: 1, max_steps: 10 };
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["type"], "step_started");
        assert_eq!(v["step"], 1);
    }

    #[test]
    fn test_preview_truncates_by_chars() {
        assert_eq!(preview("你好世界", 2), "你好...");
        assert_eq!(preview("ab", 5), "ab");
    }
}
