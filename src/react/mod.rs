//! 执行层：Step Engine、可插拔策略、运行事件

pub mod engine;
pub mod events;
pub mod policy;

pub use engine::{StepEngine, StepOutcome};
pub use events::RunEvent;
pub use policy::{
    AlwaysContinue, ContextHook, ContinuePolicy, DoneMarker, EnginePolicies, NextStepPrompt,
    ObservationLimit, ResultHook, StopOnContent, StuckDetector, ToolChoice,
};
