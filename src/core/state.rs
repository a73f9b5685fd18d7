//! 生命周期状态机
//!
//! AgentState 只能经由 StateMachine::transition 改变；允许的边：
//! Idle→Reasoning、Reasoning→Acting、Acting→Reasoning、Reasoning→Finished、任意非终态→Failed。
//! Finished / Failed 为终态，不再离开。

use serde::Serialize;

use crate::core::AgentError;

/// Agent 生命周期状态
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    Idle,
    Reasoning,
    Acting,
    Finished,
    Failed,
}

impl AgentState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, AgentState::Finished | AgentState::Failed)
    }

    /// 是否为允许的状态边
    pub fn can_transition(&self, to: AgentState) -> bool {
        use AgentState::*;
        match (*self, to) {
            (Finished, _) | (Failed, _) => false,
            (_, Failed) => true,
            (Idle, Reasoning) | (Reasoning, Acting) | (Acting, Reasoning) | (Reasoning, Finished) => true,
            _ => false,
        }
    }
}

/// 状态机：持有当前状态与已走过的边（用于观测与测试）
#[derive(Debug, Clone)]
pub struct StateMachine {
    state: AgentState,
    transitions: Vec<(AgentState, AgentState)>,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine {
    pub fn new() -> Self {
        Self {
            state: AgentState::Idle,
            transitions: Vec::new(),
        }
    }

    pub fn state(&self) -> AgentState {
        self.state
    }

    pub fn transitions(&self) -> &[(AgentState, AgentState)] {
        &self.transitions
    }

    pub fn transition(&mut self, to: AgentState) -> Result<(), AgentError> {
        let from = self.state;
        if !from.can_transition(to) {
            return Err(AgentError::InvalidTransition { from, to });
        }
        tracing::debug!(?from, ?to, "state transition");
        self.state = to;
        self.transitions.push((from, to));
        Ok(())
    }

    /// 转入 Failed；已处于终态时保持不变
    pub fn fail(&mut self) {
        if !self.state.is_terminal() {
            let from = self.state;
            self.state = AgentState::Failed;
            self.transitions.push((from, AgentState::Failed));
        }
    }
}
