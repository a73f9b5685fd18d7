//! Step Engine 的可插拔策略
//!
//! 同一个 StepEngine 通过组合不同策略得到不同行为：
//! - ContinuePolicy：纯文本回答后继续还是结束
//! - ContextHook：每步在快照之后追加仅用于本次推理的条目（不写入上下文）
//! - ResultHook：调用结果写入上下文前的后处理
//! - ToolChoice：是否允许 / 是否必须调用能力
//! - 终止能力集合：成功调用即结束运行

use std::collections::HashSet;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;

use crate::memory::{Role, Turn};
use crate::tools::{InvocationResult, TERMINATE};

/// 纯文本回答之后是否继续
pub trait ContinuePolicy: Send + Sync {
    fn should_continue(&self, content: &str) -> bool;
}

/// 永远继续，只有终止能力或步数上限能结束运行
#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysContinue;

impl ContinuePolicy for AlwaysContinue {
    fn should_continue(&self, _content: &str) -> bool {
        true
    }
}

/// 任何纯文本回答都视为最终答案
#[derive(Debug, Default, Clone, Copy)]
pub struct StopOnContent;

impl ContinuePolicy for StopOnContent {
    fn should_continue(&self, _content: &str) -> bool {
        false
    }
}

/// 回答中出现标记时结束
#[derive(Debug, Clone)]
pub struct DoneMarker(pub String);

impl ContinuePolicy for DoneMarker {
    fn should_continue(&self, content: &str) -> bool {
        !content.contains(&self.0)
    }
}

/// 推理前的上下文增强
pub trait ContextHook: Send + Sync {
    fn augment(&self, turns: &[Turn]) -> Vec<Turn>;
}

/// 每步追加一条固定的 user 指令
#[derive(Debug, Clone)]
pub struct NextStepPrompt(pub String);

impl ContextHook for NextStepPrompt {
    fn augment(&self, _turns: &[Turn]) -> Vec<Turn> {
        vec![Turn::user(self.0.clone())]
    }
}

pub const STUCK_PROMPT: &str = "Observed duplicate responses. Consider new strategies and avoid repeating ineffective paths already attempted.";

/// 检测 assistant 反复给出相同内容，注入换策略提示
#[derive(Debug, Clone)]
pub struct StuckDetector {
    pub duplicate_threshold: usize,
}

impl StuckDetector {
    pub fn new(duplicate_threshold: usize) -> Self {
        Self {
            duplicate_threshold: duplicate_threshold.max(1),
        }
    }

    /// 最近一条 assistant 文本在更早的 assistant 条目中出现次数 ≥ 阈值
    pub fn is_stuck(&self, turns: &[Turn]) -> bool {
        let mut assistants = turns.iter().rev().filter(|t| t.role == Role::Assistant);
        let Some(last) = assistants.next() else {
            return false;
        };
        let text = last.text_content();
        if text.is_empty() {
            return false;
        }
        assistants.filter(|t| t.text_content() == text).count() >= self.duplicate_threshold
    }
}

impl ContextHook for StuckDetector {
    fn augment(&self, turns: &[Turn]) -> Vec<Turn> {
        if self.is_stuck(turns) {
            tracing::warn!("agent detected stuck state, injecting strategy hint");
            vec![Turn::user(STUCK_PROMPT)]
        } else {
            Vec::new()
        }
    }
}

/// 调用结果写入上下文前的处理
pub trait ResultHook: Send + Sync {
    fn process(&self, result: InvocationResult) -> InvocationResult;
}

/// 截断过长的成功输出
#[derive(Debug, Clone, Copy)]
pub struct ObservationLimit {
    pub max_chars: usize,
}

impl ResultHook for ObservationLimit {
    fn process(&self, mut result: InvocationResult) -> InvocationResult {
        if !result.is_ok() {
            return result;
        }
        let text = result.render();
        if text.chars().count() > self.max_chars {
            result.output = Value::String(text.chars().take(self.max_chars).collect());
        }
        result
    }
}

/// 能力调用模式
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolChoice {
    /// 模型自行决定
    #[default]
    Auto,
    /// 忽略调用请求，只接受文本
    None,
    /// 每步都必须调用能力
    Required,
}

/// StepEngine 的策略组合
#[derive(Clone)]
pub struct EnginePolicies {
    pub continue_policy: Arc<dyn ContinuePolicy>,
    pub context_hooks: Vec<Arc<dyn ContextHook>>,
    pub result_hooks: Vec<Arc<dyn ResultHook>>,
    pub tool_choice: ToolChoice,
    pub terminal_capabilities: HashSet<String>,
}

impl Default for EnginePolicies {
    fn default() -> Self {
        Self {
            continue_policy: Arc::new(AlwaysContinue),
            context_hooks: Vec::new(),
            result_hooks: Vec::new(),
            tool_choice: ToolChoice::Auto,
            terminal_capabilities: HashSet::from([TERMINATE.to_string()]),
        }
    }
}

impl EnginePolicies {
    pub fn with_continue_policy(mut self, policy: impl ContinuePolicy + 'static) -> Self {
        self.continue_policy = Arc::new(policy);
        self
    }

    pub fn with_context_hook(mut self, hook: impl ContextHook + 'static) -> Self {
        self.context_hooks.push(Arc::new(hook));
        self
    }

    pub fn with_result_hook(mut self, hook: impl ResultHook + 'static) -> Self {
        self.result_hooks.push(Arc::new(hook));
        self
    }

    pub fn with_tool_choice(mut self, tool_choice: ToolChoice) -> Self {
        self.tool_choice = tool_choice;
        self
    }

    pub fn with_terminal(mut self, name: impl Into<String>) -> Self {
        self.terminal_capabilities.insert(name.into());
        self
    }

    pub fn is_terminal(&self, capability: &str) -> bool {
        self.terminal_capabilities.contains(capability)
    }

    /// 依次应用全部 ResultHook
    pub fn process_result(&self, result: InvocationResult) -> InvocationResult {
        self.result_hooks.iter().fold(result, |r, hook| hook.process(r))
    }

    /// 收集全部 ContextHook 的追加条目
    pub fn augment(&self, turns: &[Turn]) -> Vec<Turn> {
        self.context_hooks.iter().flat_map(|h| h.augment(turns)).collect()
    }
}
