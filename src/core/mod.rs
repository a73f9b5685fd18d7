//! 核心层：错误与失败类别、生命周期状态机、恢复策略、工具并发调度、运行监管

pub mod error;
pub mod recovery;
pub mod state;
pub mod supervisor;
pub mod task_scheduler;

pub use error::{AgentError, FailureClass, RecoveryAction};
pub use recovery::{RecoveryEngine, RetryPolicy};
pub use state::{AgentState, StateMachine};
pub use supervisor::{FinalResult, RunStatus, Supervisor};
pub use task_scheduler::TaskScheduler;
