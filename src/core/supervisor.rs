//! 运行监管：步数上限、单步超时、溢出压缩重试、取消
//!
//! 持有 CancellationToken 与 StepEngine；每步派生子 token，超时或取消时触发它并丢弃 step future，
//! 正在执行的调用由此观察到取消。已产生的副作用不回滚，只在 FinalResult 中报告。

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::core::{AgentError, FailureClass, RecoveryAction, RecoveryEngine, RetryPolicy};
use crate::react::events::send_event;
use crate::react::{RunEvent, StepEngine, StepOutcome};

/// 运行结局
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    /// 达到步数上限（不是错误）
    Truncated,
    Failed,
}

/// 一次运行的最终结果
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FinalResult {
    pub status: RunStatus,
    pub content: String,
    pub step_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_class: Option<FailureClass>,
}

impl FinalResult {
    pub fn success(content: impl Into<String>, step_count: usize) -> Self {
        Self {
            status: RunStatus::Success,
            content: content.into(),
            step_count,
            error_detail: None,
            failure_class: None,
        }
    }

    pub fn truncated(content: impl Into<String>, step_count: usize) -> Self {
        Self {
            status: RunStatus::Truncated,
            ..Self::success(content, step_count)
        }
    }

    pub fn failed(err: &AgentError, content: impl Into<String>, step_count: usize) -> Self {
        Self {
            status: RunStatus::Failed,
            content: content.into(),
            step_count,
            error_detail: Some(err.to_string()),
            failure_class: Some(err.class()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Success
    }
}

enum Interrupt {
    Cancelled,
    TimedOut,
}

/// 驱动 StepEngine 直到终止、失败或步数耗尽
pub struct Supervisor {
    engine: StepEngine,
    recovery: RecoveryEngine,
    budget: usize,
    cancel_token: CancellationToken,
}

impl Supervisor {
    pub fn new(engine: StepEngine) -> Self {
        Self {
            engine,
            recovery: RecoveryEngine::default(),
            budget: 8000,
            cancel_token: CancellationToken::new(),
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.recovery = RecoveryEngine::new(policy);
        self
    }

    /// 压缩时使用的上下文预算（与 SizeFn 同单位）
    pub fn with_budget(mut self, budget: usize) -> Self {
        self.budget = budget;
        self
    }

    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel_token = token;
        self
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    /// 触发取消：运行在下一个挂起点结束
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    pub fn engine(&self) -> &StepEngine {
        &self.engine
    }

    pub fn into_engine(self) -> StepEngine {
        self.engine
    }

    pub async fn run(&mut self, max_steps: usize, step_timeout: Duration) -> FinalResult {
        let mut steps = 0usize;
        let mut overflow_attempts = 0u32;

        if max_steps == 0 {
            return self.truncate(steps);
        }

        loop {
            let step = steps + 1;
            if self.cancel_token.is_cancelled() {
                return self.abort(AgentError::Cancelled, steps);
            }

            tracing::info!(step, max_steps, "step started");
            send_event(
                self.engine.event_tx(),
                RunEvent::StepStarted { step, max_steps },
            );

            let step_token = self.cancel_token.child_token();
            let outcome = tokio::select! {
                biased;
                _ = self.cancel_token.cancelled() => Err(Interrupt::Cancelled),
                r = tokio::time::timeout(step_timeout, self.engine.step(&step_token)) => {
                    r.map_err(|_| Interrupt::TimedOut)
                }
            };

            let outcome = match outcome {
                Ok(outcome) => outcome,
                Err(Interrupt::Cancelled) => {
                    step_token.cancel();
                    return self.abort(AgentError::Cancelled, step);
                }
                Err(Interrupt::TimedOut) => {
                    step_token.cancel();
                    let in_flight = self.engine.in_flight();
                    let completed = self.engine.record_completed();
                    if !in_flight.is_empty() {
                        tracing::warn!(?in_flight, ?completed, "step timed out with invocations in flight");
                    }
                    let err = AgentError::StepTimeout {
                        step,
                        timeout_ms: step_timeout.as_millis() as u64,
                        in_flight,
                        completed,
                    };
                    return self.abort(err, step);
                }
            };

            match outcome {
                StepOutcome::Continue => {
                    steps = step;
                    overflow_attempts = 0;
                    if steps >= max_steps {
                        tracing::warn!(max_steps, "step budget exhausted, truncating");
                        return self.truncate(steps);
                    }
                }
                StepOutcome::Terminate => {
                    steps = step;
                    let result = FinalResult::success(self.engine.last_content(), steps);
                    self.finished(&result);
                    return result;
                }
                // 引擎已进入终态时没有可重入的步骤
                StepOutcome::Errored(err) if self.engine.state().is_terminal() => {
                    return self.abort(err, step);
                }
                StepOutcome::Errored(err) => match self.recovery.handle(&err, overflow_attempts) {
                    RecoveryAction::CompressAndRetry => {
                        overflow_attempts += 1;
                        self.compress_for_retry(step, overflow_attempts, &err);
                    }
                    RecoveryAction::Abort => return self.abort(err, step),
                },
            }
        }
    }

    /// 超预算时压到预算内；已在预算内（服务端更严格）时再减半，保证每次重试都有进展
    fn compress_for_retry(&mut self, step: usize, attempt: u32, err: &AgentError) {
        let size = self.engine.context().total_size();
        let target = if size > self.budget { self.budget } else { size / 2 };
        let report = self.engine.context_mut().compress(target);
        tracing::warn!(
            step,
            attempt,
            removed = report.removed,
            size_before = report.size_before,
            size_after = report.size_after,
            "compressing context and retrying step"
        );
        send_event(
            self.engine.event_tx(),
            RunEvent::Recovery {
                action: "compress_and_retry".to_string(),
                detail: format!(
                    "{} (attempt {}, {} turns removed)",
                    err, attempt, report.removed
                ),
            },
        );
    }

    fn truncate(&mut self, steps: usize) -> FinalResult {
        if let Err(e) = self.engine.finish() {
            return self.abort(e, steps);
        }
        let result = FinalResult::truncated(self.engine.last_content(), steps);
        self.finished(&result);
        result
    }

    fn abort(&mut self, err: AgentError, steps: usize) -> FinalResult {
        self.engine.fail();
        tracing::error!(error = %err, class = ?err.class(), steps, "run failed");
        send_event(
            self.engine.event_tx(),
            RunEvent::Error {
                class: err.class(),
                text: err.to_string(),
            },
        );
        let result = FinalResult::failed(&err, self.engine.last_content(), steps);
        self.finished(&result);
        result
    }

    fn finished(&self, result: &FinalResult) {
        tracing::info!(status = ?result.status, steps = result.step_count, "run finished");
        send_event(
            self.engine.event_tx(),
            RunEvent::Finished {
                status: result.status,
                step_count: result.step_count,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::core::AgentState;
    use crate::llm::{Decision, LlmError, ScriptedPort};
    use crate::memory::Turn;
    use crate::tools::{CapabilityRegistry, EchoCapability, TerminateCapability, ToolDispatcher};
    use serde_json::json;

    fn supervisor(port: ScriptedPort) -> Supervisor {
        let registry = Arc::new(
            CapabilityRegistry::builder()
                .register(EchoCapability)
                .register(TerminateCapability)
                .build(),
        );
        let dispatcher = Arc::new(ToolDispatcher::new(registry, 5));
        let mut engine = StepEngine::new(Arc::new(port), dispatcher);
        engine.context_mut().append(Turn::user("go"));
        Supervisor::new(engine)
    }

    #[tokio::test]
    async fn test_terminate_is_success() {
        let mut sup = supervisor(ScriptedPort::new(vec![
            Ok(Decision::call("echo", json!({"text": "hi"}))),
            Ok(Decision::call("terminate", json!({"status": "success"}))),
        ]));
        let result = sup.run(10, Duration::from_secs(5)).await;
        assert_eq!(result.status, RunStatus::Success);
        assert_eq!(result.content, "hi");
        assert_eq!(result.step_count, 2);
        assert_eq!(sup.engine().state(), AgentState::Finished);
    }

    #[tokio::test]
    async fn test_truncated_at_max_steps() {
        let mut sup = supervisor(ScriptedPort::repeating(Decision::call("echo", json!({"text": "x"}))));
        let result = sup.run(3, Duration::from_secs(5)).await;
        assert_eq!(result.status, RunStatus::Truncated);
        assert_eq!(result.step_count, 3);
        assert_eq!(sup.engine().state(), AgentState::Finished);
    }

    #[tokio::test]
    async fn test_zero_max_steps() {
        let mut sup = supervisor(ScriptedPort::new(vec![]));
        let result = sup.run(0, Duration::from_secs(5)).await;
        assert_eq!(result.status, RunStatus::Truncated);
        assert_eq!(result.step_count, 0);
    }

    #[tokio::test]
    async fn test_overflow_exhausts_retries() {
        let mut sup = supervisor(ScriptedPort::new(vec![
            Err(LlmError::ContextOverflow("a".into())),
            Err(LlmError::ContextOverflow("b".into())),
            Err(LlmError::ContextOverflow("c".into())),
        ]))
        .with_retry_policy(RetryPolicy::context_overflow(2));
        let result = sup.run(10, Duration::from_secs(5)).await;
        assert_eq!(result.status, RunStatus::Failed);
        assert_eq!(result.failure_class, Some(FailureClass::ContextOverflow));
        assert_eq!(result.step_count, 1);
        assert_eq!(sup.engine().state(), AgentState::Failed);
    }

    #[tokio::test]
    async fn test_policy_on_llm_class_fails_with_original_error() {
        let mut sup = supervisor(ScriptedPort::new(vec![
            Err(LlmError::Request("503".into())),
            Ok(Decision::call("terminate", json!({"status": "success"}))),
        ]))
        .with_retry_policy(RetryPolicy::new(2, |c| c == FailureClass::Llm));
        let result = sup.run(10, Duration::from_secs(5)).await;
        assert_eq!(result.status, RunStatus::Failed);
        assert_eq!(result.failure_class, Some(FailureClass::Llm));
        assert!(result.error_detail.unwrap().contains("503"));
        assert_eq!(sup.engine().state(), AgentState::Failed);
    }

    #[tokio::test]
    async fn test_unretried_port_error_ends_failed() {
        let mut sup = supervisor(ScriptedPort::new(vec![Err(LlmError::Request("503".into()))]));
        let result = sup.run(10, Duration::from_secs(5)).await;
        assert_eq!(result.failure_class, Some(FailureClass::Llm));
        assert_eq!(sup.engine().state(), AgentState::Failed);
    }

    #[tokio::test]
    async fn test_step_timeout_is_fatal() {
        let port = ScriptedPort::new(vec![]).with_delay(Duration::from_millis(300));
        let mut sup = supervisor(port);
        let result = sup.run(5, Duration::from_millis(50)).await;
        assert_eq!(result.status, RunStatus::Failed);
        assert_eq!(result.failure_class, Some(FailureClass::StepTimeout));
        assert_eq!(sup.engine().state(), AgentState::Failed);
    }

    #[tokio::test]
    async fn test_cancel_before_run() {
        let mut sup = supervisor(ScriptedPort::new(vec![]));
        sup.cancel();
        let result = sup.run(5, Duration::from_secs(5)).await;
        assert_eq!(result.failure_class, Some(FailureClass::Cancelled));
    }

    #[test]
    fn test_final_result_json() {
        let v = serde_json::to_value(FinalResult::truncated("x", 5)).unwrap();
        assert_eq!(v["status"], "truncated");
        assert!(v.get("error_detail").is_none());
    }
}
