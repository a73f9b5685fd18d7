//! Step Engine：单步 推理 → （可选）行动
//!
//! 每次 step：进入 Reasoning，用上下文快照（加上 ContextHook 的临时条目）询问 Reasoning Port；
//! 得到调用请求则进入 Acting，交给 ToolDispatcher，按请求顺序把结果写回上下文；
//! 得到纯文本则写入 assistant 条目，由 ContinuePolicy 决定继续还是结束。
//!
//! 上下文溢出是唯一留在 Reasoning 返回 Errored 的错误（由 Supervisor 压缩后重入）；
//! 其它故障一律先转入 Failed 再返回 Errored。

use std::sync::Arc;

use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

use crate::core::{AgentError, AgentState, StateMachine};
use crate::llm::{Decision, LlmError, ReasoningPort};
use crate::memory::{ContextStore, Turn};
use crate::react::events::{preview, send_event, RunEvent};
use crate::react::policy::{EnginePolicies, ToolChoice};
use crate::tools::{InvocationRequest, InvocationResult, InvocationTracker, ToolDispatcher};

/// 单步结果
#[derive(Debug)]
pub enum StepOutcome {
    Continue,
    Terminate,
    Errored(AgentError),
}

pub struct StepEngine {
    port: Arc<dyn ReasoningPort>,
    dispatcher: Arc<ToolDispatcher>,
    context: ContextStore,
    machine: StateMachine,
    policies: EnginePolicies,
    event_tx: Option<UnboundedSender<RunEvent>>,
    /// 当前 acting 阶段的调用完成情况；step 被中途丢弃时保留原值
    tracker: InvocationTracker,
    last_content: Option<String>,
}

impl StepEngine {
    pub fn new(port: Arc<dyn ReasoningPort>, dispatcher: Arc<ToolDispatcher>) -> Self {
        Self {
            port,
            dispatcher,
            context: ContextStore::new(),
            machine: StateMachine::new(),
            policies: EnginePolicies::default(),
            event_tx: None,
            tracker: InvocationTracker::new(),
            last_content: None,
        }
    }

    pub fn with_context(mut self, context: ContextStore) -> Self {
        self.context = context;
        self
    }

    pub fn with_policies(mut self, policies: EnginePolicies) -> Self {
        self.policies = policies;
        self
    }

    pub fn with_event_tx(mut self, tx: UnboundedSender<RunEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    pub fn state(&self) -> AgentState {
        self.machine.state()
    }

    pub fn transitions(&self) -> &[(AgentState, AgentState)] {
        self.machine.transitions()
    }

    pub fn context(&self) -> &ContextStore {
        &self.context
    }

    pub fn context_mut(&mut self) -> &mut ContextStore {
        &mut self.context
    }

    /// 仍在执行的调用 id
    pub fn in_flight(&self) -> Vec<String> {
        self.tracker.pending()
    }

    /// 被丢弃的 step 中已完成的调用结果
    pub fn completed_invocations(&self) -> Vec<InvocationResult> {
        self.tracker.completed()
    }

    /// step 被超时丢弃后，把已完成调用的结果写入上下文，返回其 id
    pub fn record_completed(&mut self) -> Vec<String> {
        let completed: Vec<InvocationResult> = self
            .tracker
            .completed()
            .into_iter()
            .map(|r| self.policies.process_result(r))
            .collect();
        for result in &completed {
            send_event(
                self.event_tx.as_ref(),
                RunEvent::Observation {
                    id: result.id.clone(),
                    capability: result.name.clone(),
                    status: result.status,
                    preview: preview(&result.render(), 200),
                },
            );
            self.context.append(Turn::tool_result(result));
        }
        completed.into_iter().map(|r| r.id).collect()
    }

    pub fn event_tx(&self) -> Option<&UnboundedSender<RunEvent>> {
        self.event_tx.as_ref()
    }

    /// 最近一次可作为答案的内容：assistant 文本或非终止能力的成功输出
    pub fn last_content(&self) -> String {
        self.last_content.clone().unwrap_or_default()
    }

    /// 执行一步
    pub async fn step(&mut self, cancel: &CancellationToken) -> StepOutcome {
        if let Err(e) = self.enter_reasoning() {
            return self.fault(e);
        }

        let mut prompt = self.context.snapshot();
        let extra = self.policies.augment(&prompt);
        prompt.extend(extra);

        let decision = match self
            .port
            .decide(&prompt, self.dispatcher.registry().descriptors())
            .await
        {
            Ok(d) => d,
            Err(LlmError::ContextOverflow(detail)) => {
                tracing::warn!(detail = %detail, size = self.context.total_size(), "context overflow");
                return StepOutcome::Errored(AgentError::ContextOverflow(detail));
            }
            Err(e) => return self.fault(e.into()),
        };

        let (content, mut requests) = match decision {
            Decision::Content(text) => (Some(text), Vec::new()),
            Decision::Invocations { content, requests } => (content, requests),
        };
        if self.policies.tool_choice == ToolChoice::None && !requests.is_empty() {
            tracing::warn!(count = requests.len(), "tool_choice is none, ignoring invocations");
            requests.clear();
        }

        send_event(
            self.event_tx.as_ref(),
            RunEvent::Decision {
                content: content.clone(),
                invocations: requests.iter().map(|r| r.name.clone()).collect(),
            },
        );

        let content = content.unwrap_or_default();
        if !content.trim().is_empty() {
            self.last_content = Some(content.clone());
        }

        if requests.is_empty() {
            if self.policies.tool_choice == ToolChoice::Required {
                return self.fault(AgentError::ToolCallRequired);
            }
            self.context.append(Turn::assistant(content.clone()));
            if self.policies.continue_policy.should_continue(&content) {
                return StepOutcome::Continue;
            }
            return match self.machine.transition(AgentState::Finished) {
                Ok(()) => StepOutcome::Terminate,
                Err(e) => self.fault(e),
            };
        }

        self.act(content, requests, cancel).await
    }

    async fn act(
        &mut self,
        content: String,
        requests: Vec<InvocationRequest>,
        cancel: &CancellationToken,
    ) -> StepOutcome {
        self.context
            .append(Turn::assistant_with_invocations(content, requests.clone()));
        if let Err(e) = self.machine.transition(AgentState::Acting) {
            return self.fault(e);
        }

        for r in &requests {
            tracing::info!(tool = %r.name, id = %r.id, "invoking capability");
            send_event(
                self.event_tx.as_ref(),
                RunEvent::Invocation {
                    id: r.id.clone(),
                    capability: r.name.clone(),
                    args: r.arguments_value(),
                },
            );
        }

        let results = match self
            .dispatcher
            .dispatch_tracked(&requests, cancel, &self.tracker)
            .await
        {
            Ok(results) => results,
            Err(e) => {
                self.tracker.clear();
                return self.fault(e.into());
            }
        };
        self.tracker.clear();

        let mut terminate = false;
        for result in results {
            let result = self.policies.process_result(result);
            let rendered = result.render();
            send_event(
                self.event_tx.as_ref(),
                RunEvent::Observation {
                    id: result.id.clone(),
                    capability: result.name.clone(),
                    status: result.status,
                    preview: preview(&rendered, 200),
                },
            );
            if result.is_ok() {
                if self.policies.is_terminal(&result.name) {
                    terminate = true;
                } else {
                    self.last_content = Some(rendered);
                }
            } else {
                tracing::warn!(tool = %result.name, error = ?result.error, "capability failed");
            }
            self.context.append(Turn::tool_result(&result));
        }

        if terminate {
            tracing::info!("terminal capability invoked, finishing");
            if let Err(e) = self.finish() {
                return self.fault(e);
            }
            return StepOutcome::Terminate;
        }
        StepOutcome::Continue
    }

    /// 进入 Reasoning；已在 Reasoning（溢出重试或纯文本后继续）时为重入
    fn enter_reasoning(&mut self) -> Result<(), AgentError> {
        match self.machine.state() {
            AgentState::Reasoning => {
                tracing::debug!("re-entering reasoning phase");
                Ok(())
            }
            _ => self.machine.transition(AgentState::Reasoning),
        }
    }

    /// 正常结束：只走允许的边（Acting→Reasoning→Finished）
    pub fn finish(&mut self) -> Result<(), AgentError> {
        match self.machine.state() {
            AgentState::Finished => Ok(()),
            AgentState::Reasoning => self.machine.transition(AgentState::Finished),
            _ => {
                self.machine.transition(AgentState::Reasoning)?;
                self.machine.transition(AgentState::Finished)
            }
        }
    }

    /// 转入 Failed（已在终态时无操作）
    pub fn fail(&mut self) {
        self.machine.fail();
    }

    fn fault(&mut self, err: AgentError) -> StepOutcome {
        tracing::error!(error = %err, state = ?self.machine.state(), "step failed");
        self.machine.fail();
        StepOutcome::Errored(err)
    }
}
