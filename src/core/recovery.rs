//! 错误恢复引擎与有界重试策略
//!
//! RetryPolicy = (最大尝试次数, 失败类别谓词)，作为对象注入 Supervisor；
//! RecoveryEngine 根据 AgentError 与已重试次数返回 RecoveryAction。
//! 谓词只在可重入的类别（目前只有 context-overflow）中做筛选：其它类别出现时引擎已进入 Failed，
//! 无论谓词如何都不会重试。LLM 的瞬时错误在 RetryingLlmClient 一层退避重试。

use std::fmt;
use std::sync::Arc;

use crate::core::{AgentError, FailureClass, RecoveryAction};

type ClassPredicate = Arc<dyn Fn(FailureClass) -> bool + Send + Sync>;

/// 有界重试策略：只有谓词命中的失败类别才会重试，且最多 max_attempts 次
#[derive(Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    predicate: ClassPredicate,
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .finish_non_exhaustive()
    }
}

impl RetryPolicy {
    pub fn new(
        max_attempts: u32,
        predicate: impl Fn(FailureClass) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            max_attempts,
            predicate: Arc::new(predicate),
        }
    }

    /// 仅对 context-overflow 重试
    pub fn context_overflow(max_attempts: u32) -> Self {
        Self::new(max_attempts, |class| class == FailureClass::ContextOverflow)
    }

    pub fn never() -> Self {
        Self::new(0, |_| false)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn is_retryable(&self, class: FailureClass) -> bool {
        class.is_reentrant() && (self.predicate)(class)
    }

    /// 已重试 attempts 次之后是否还允许再试一次
    pub fn allows(&self, class: FailureClass, attempts: u32) -> bool {
        self.is_retryable(class) && attempts < self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::context_overflow(2)
    }
}

/// 将错误映射为可执行动作（压缩重试 / 终止）
#[derive(Debug, Default, Clone)]
pub struct RecoveryEngine {
    policy: RetryPolicy,
}

impl RecoveryEngine {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// attempts 为当前步已经做过的重试次数
    pub fn handle(&self, err: &AgentError, attempts: u32) -> RecoveryAction {
        let class = err.class();
        // 超时与取消永不重试，不受策略谓词影响
        if matches!(class, FailureClass::StepTimeout | FailureClass::Cancelled) {
            return RecoveryAction::Abort;
        }
        if self.policy.allows(class, attempts) {
            RecoveryAction::CompressAndRetry
        } else {
            RecoveryAction::Abort
        }
    }
}
