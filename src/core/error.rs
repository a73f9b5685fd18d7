//! Agent 错误类型、失败类别与恢复动作
//!
//! 与 RecoveryEngine 配合：根据 AgentError 的 FailureClass 决定 CompressAndRetry 还是 Abort。
//! 能力级错误（参数校验、能力运行时错误）不会出现在这里：它们在 ToolDispatcher 内就地转为 tool-result。

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::state::AgentState;
use crate::llm::LlmError;
use crate::tools::DispatchError;

/// 运行过程中冒泡到 Supervisor 的错误
#[derive(Error, Debug, Clone)]
pub enum AgentError {
    /// 上下文超出 Reasoning Port 可接受的输入长度（可恢复：压缩后重试）
    #[error("Context window exceeded: {0}")]
    ContextOverflow(String),

    /// Reasoning Port 返回的内容无法解析（格式错误的 JSON 等）
    #[error("Reasoning protocol error: {0}")]
    Protocol(String),

    #[error("LLM error: {0}")]
    Llm(String),

    /// 单步超时；in_flight 为超时时仍在执行的调用 id，completed 为已完成的（副作用不回滚，仅记录）
    #[error("Step {step} timed out after {timeout_ms}ms (in-flight: {in_flight:?}, completed: {completed:?})")]
    StepTimeout {
        step: usize,
        timeout_ms: u64,
        in_flight: Vec<String>,
        completed: Vec<String>,
    },

    /// 分发器自身故障（非单个能力的错误）
    #[error("Dispatcher fault: {0}")]
    Dispatch(#[from] DispatchError),

    /// tool_choice = required 但模型没有给出任何调用
    #[error("Tool call required but none was provided")]
    ToolCallRequired,

    #[error("Invalid state transition: {from:?} -> {to:?}")]
    InvalidTransition { from: AgentState, to: AgentState },

    #[error("Cancelled")]
    Cancelled,

    #[error("Config error: {0}")]
    Config(String),
}

impl From<LlmError> for AgentError {
    fn from(err: LlmError) -> Self {
        match err {
            LlmError::ContextOverflow(detail) => AgentError::ContextOverflow(detail),
            LlmError::Protocol(detail) => AgentError::Protocol(detail),
            other => AgentError::Llm(other.to_string()),
        }
    }
}

/// 失败类别：FinalResult 中的标签，也是 RetryPolicy 的判定输入
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    ContextOverflow,
    Protocol,
    Llm,
    StepTimeout,
    Dispatcher,
    ToolCallRequired,
    InvalidTransition,
    Cancelled,
    Config,
}

impl FailureClass {
    /// StepEngine 报告该类错误后仍停在 Reasoning，可以重入同一步；其它类别出现时引擎已是 Failed
    pub fn is_reentrant(&self) -> bool {
        matches!(self, FailureClass::ContextOverflow)
    }
}

impl AgentError {
    pub fn class(&self) -> FailureClass {
        match self {
            AgentError::ContextOverflow(_) => FailureClass::ContextOverflow,
            AgentError::Protocol(_) => FailureClass::Protocol,
            AgentError::Llm(_) => FailureClass::Llm,
            AgentError::StepTimeout { .. } => FailureClass::StepTimeout,
            AgentError::Dispatch(_) => FailureClass::Dispatcher,
            AgentError::ToolCallRequired => FailureClass::ToolCallRequired,
            AgentError::InvalidTransition { .. } => FailureClass::InvalidTransition,
            AgentError::Cancelled => FailureClass::Cancelled,
            AgentError::Config(_) => FailureClass::Config,
        }
    }
}

/// 恢复引擎根据错误类别给出的动作
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    /// 压缩上下文后重试同一步
    CompressAndRetry,
    /// 终止本次运行
    Abort,
}
