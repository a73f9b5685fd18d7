//! Bee Runtime - Agent 执行运行时
//!
//! 模块划分：
//! - **agent**: Runtime（按运行隔离上下文，共享只读注册表）
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误、状态机、恢复策略、任务调度、Supervisor
//! - **llm**: LLM 客户端（OpenAI 兼容 / Mock）与 Reasoning Port
//! - **memory**: Turn、上下文存储与压缩、运行记录持久化
//! - **observability**: tracing 初始化
//! - **react**: Step Engine、策略、运行事件
//! - **tools**: 能力注册表、schema 校验、分发器、内置能力

pub mod agent;
pub mod config;
pub mod core;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod react;
pub mod tools;

pub use agent::Runtime;
pub use core::{FinalResult, RunStatus};
