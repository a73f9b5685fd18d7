//! Headless 运行时
//!
//! Runtime 持有进程内共享的只读能力注册表、Reasoning Port 与分发器；
//! 每次 start 新建独立的上下文、状态机与 Supervisor，多次运行可并发执行。
//! 每次运行结束（不论结局）都会调用所有能力的 cleanup。

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::core::{FinalResult, RetryPolicy, Supervisor, TaskScheduler};
use crate::llm::{
    LlmClient, LlmPort, MockLlmClient, OpenAiClient, ReasoningPort, RetryConfig, RetryingLlmClient,
};
use crate::memory::{
    token_size, ContextStore, MarkerSummarizer, NoopSink, SizeFn, Transcript, TranscriptSink,
    Turn,
};
use crate::react::{
    EnginePolicies, NextStepPrompt, ObservationLimit, RunEvent, StepEngine, StuckDetector,
};
use crate::tools::{CapabilityRegistry, EchoCapability, TerminateCapability, ToolDispatcher};

/// 内置能力：echo、terminate
pub fn default_registry() -> CapabilityRegistry {
    CapabilityRegistry::builder()
        .register(EchoCapability)
        .register(TerminateCapability)
        .build()
}

/// 按配置选择 LLM 后端：provider = openai 且设置了 OPENAI_API_KEY 时走 OpenAI 兼容端点，否则 Mock
pub fn create_llm_from_config(cfg: &AppConfig) -> Arc<dyn LlmClient> {
    let provider = cfg.llm.provider.to_lowercase();
    let api_key = std::env::var("OPENAI_API_KEY").ok();

    match (provider.as_str(), api_key) {
        ("openai", Some(key)) => {
            tracing::info!("Using OpenAI LLM ({})", cfg.llm.model);
            let client = OpenAiClient::new(cfg.llm.base_url.as_deref(), &cfg.llm.model, Some(&key))
                .with_request_timeout(Duration::from_secs(cfg.llm.request_timeout_secs));
            Arc::new(RetryingLlmClient::new(Arc::new(client), RetryConfig::default()))
        }
        ("openai", None) => {
            tracing::warn!("provider is openai but OPENAI_API_KEY is not set, using Mock LLM");
            Arc::new(MockLlmClient)
        }
        _ => {
            tracing::info!("Using Mock LLM");
            Arc::new(MockLlmClient)
        }
    }
}

pub fn create_port_from_config(cfg: &AppConfig) -> Arc<dyn ReasoningPort> {
    Arc::new(LlmPort::new(create_llm_from_config(cfg)))
}

/// 运行时：注册表与 Port 在运行之间共享，上下文与状态按运行独立
pub struct Runtime {
    registry: Arc<CapabilityRegistry>,
    port: Arc<dyn ReasoningPort>,
    dispatcher: Arc<ToolDispatcher>,
    config: AppConfig,
    sink: Arc<dyn TranscriptSink>,
    size_fn: SizeFn,
    policies: Option<EnginePolicies>,
}

impl Runtime {
    pub fn new(
        registry: Arc<CapabilityRegistry>,
        port: Arc<dyn ReasoningPort>,
        config: AppConfig,
    ) -> Self {
        let dispatcher = ToolDispatcher::new(registry.clone(), config.tools.tool_timeout_secs)
            .with_parallel(config.tools.parallel)
            .with_scheduler(TaskScheduler::new(config.tools.max_concurrent));
        let sink: Arc<dyn TranscriptSink> = match &config.context.transcript_dir {
            Some(dir) => Arc::new(crate::memory::JsonFileSink::new(dir)),
            None => Arc::new(NoopSink),
        };
        Self {
            registry,
            port,
            dispatcher: Arc::new(dispatcher),
            config,
            sink,
            size_fn: token_size(),
            policies: None,
        }
    }

    /// 内置能力 + 按配置选择的 Port
    pub fn from_config(config: AppConfig) -> Self {
        let port = create_port_from_config(&config);
        Self::new(Arc::new(default_registry()), port, config)
    }

    pub fn with_sink(mut self, sink: Arc<dyn TranscriptSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_size_fn(mut self, size_fn: SizeFn) -> Self {
        self.size_fn = size_fn;
        self
    }

    /// 覆盖由配置推导的策略
    pub fn with_policies(mut self, policies: EnginePolicies) -> Self {
        self.policies = Some(policies);
        self
    }

    pub fn registry(&self) -> &Arc<CapabilityRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    fn engine_policies(&self) -> EnginePolicies {
        if let Some(p) = &self.policies {
            return p.clone();
        }
        let rt = &self.config.runtime;
        let mut policies = EnginePolicies::default()
            .with_tool_choice(rt.tool_choice)
            .with_context_hook(StuckDetector::new(rt.duplicate_threshold));
        if let Some(prompt) = &rt.next_step_prompt {
            policies = policies.with_context_hook(NextStepPrompt(prompt.clone()));
        }
        if let Some(max_chars) = self.config.tools.max_observe {
            policies = policies.with_result_hook(ObservationLimit { max_chars });
        }
        policies
    }

    /// 以一条用户输入开始一次运行
    pub async fn start(&self, input: &str) -> FinalResult {
        self.run(input, None, CancellationToken::new()).await
    }

    /// 同 start，并把运行事件推送到 tx
    pub async fn start_with_events(
        &self,
        input: &str,
        tx: UnboundedSender<RunEvent>,
    ) -> FinalResult {
        self.run(input, Some(tx), CancellationToken::new()).await
    }

    /// 同 start，调用方可通过 token 取消
    pub async fn start_with_cancel(&self, input: &str, token: CancellationToken) -> FinalResult {
        self.run(input, None, token).await
    }

    async fn run(
        &self,
        input: &str,
        tx: Option<UnboundedSender<RunEvent>>,
        cancel: CancellationToken,
    ) -> FinalResult {
        let run_id = uuid::Uuid::new_v4().to_string();
        let started_at = Utc::now();
        tracing::info!(run_id = %run_id, "run started");

        let mut context = ContextStore::new().with_size_fn(self.size_fn.clone());
        if self.config.context.summarize {
            context = context.with_summarizer(MarkerSummarizer);
        }
        context.append(Turn::user(input));

        let mut engine = StepEngine::new(self.port.clone(), self.dispatcher.clone())
            .with_context(context)
            .with_policies(self.engine_policies());
        if let Some(tx) = tx {
            engine = engine.with_event_tx(tx);
        }

        let rt = &self.config.runtime;
        let mut supervisor = Supervisor::new(engine)
            .with_retry_policy(RetryPolicy::context_overflow(rt.max_overflow_retries))
            .with_budget(self.config.context.budget_tokens)
            .with_cancel_token(cancel);
        let result = supervisor
            .run(rt.max_steps, Duration::from_secs(rt.step_timeout_secs))
            .await;
        self.registry.cleanup_all().await;

        let transcript = Transcript {
            run_id: run_id.clone(),
            started_at,
            finished_at: Utc::now(),
            turns: supervisor.engine().context().snapshot(),
            result: result.clone(),
        };
        if let Err(e) = self.sink.record(&transcript) {
            tracing::warn!(run_id = %run_id, error = %e, "failed to record transcript");
        }
        result
    }
}
