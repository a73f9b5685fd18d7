//! 工具分发器
//!
//! dispatch(requests) 为每个请求产出恰好一个结果，顺序与请求一致（与完成顺序无关）。
//! 不存在的能力 → not_found（不调用任何东西）；参数不合 schema → capability_error；
//! 能力返回 Err、panic、超时或被取消 → capability_error（可恢复，批次继续）。
//! 只有分发器自身的故障（调度器已关闭）才以 DispatchError 向上传播。
//! 每次调用输出结构化审计日志（JSON）。

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use futures_util::FutureExt;
use serde_json::Value;
use thiserror::Error;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::core::TaskScheduler;
use crate::tools::{
    CapabilityRegistry, InvocationContext, InvocationRequest, InvocationResult, RegistryError,
};

/// 分发器自身的故障（致命，向上传播）
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("tool scheduler is closed")]
    SchedulerClosed,
}

/// 一批调用的完成情况：每个调用结束时从 pending 移到 completed
///
/// step 被超时丢弃时，Supervisor 据此区分已完成与仍在执行的调用。
#[derive(Clone, Debug, Default)]
pub struct InvocationTracker {
    inner: Arc<Mutex<TrackerState>>,
}

#[derive(Debug, Default)]
struct TrackerState {
    order: Vec<String>,
    pending: Vec<String>,
    completed: Vec<InvocationResult>,
}

impl InvocationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// 开始新一批：清空上一批的记录
    pub fn begin(&self, requests: &[InvocationRequest]) {
        let mut state = self.lock();
        state.order = requests.iter().map(|r| r.id.clone()).collect();
        state.pending = state.order.clone();
        state.completed.clear();
    }

    fn complete(&self, result: &InvocationResult) {
        let mut state = self.lock();
        state.pending.retain(|id| id != &result.id);
        state.completed.push(result.clone());
    }

    /// 仍在执行的调用 id（按请求顺序）
    pub fn pending(&self) -> Vec<String> {
        self.lock().pending.clone()
    }

    /// 已完成调用的结果（按请求顺序）
    pub fn completed(&self) -> Vec<InvocationResult> {
        let state = self.lock();
        let mut completed = state.completed.clone();
        completed.sort_by_key(|r| state.order.iter().position(|id| id == &r.id));
        completed
    }

    pub fn clear(&self) {
        let mut state = self.lock();
        state.order.clear();
        state.pending.clear();
        state.completed.clear();
    }
}

/// 能力调用分发器：持有只读注册表、并发调度器与单次调用超时
pub struct ToolDispatcher {
    registry: Arc<CapabilityRegistry>,
    scheduler: TaskScheduler,
    timeout: Duration,
    parallel: bool,
}

impl ToolDispatcher {
    pub fn new(registry: Arc<CapabilityRegistry>, timeout_secs: u64) -> Self {
        Self {
            registry,
            scheduler: TaskScheduler::default(),
            timeout: Duration::from_secs(timeout_secs),
            parallel: true,
        }
    }

    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    pub fn with_scheduler(mut self, scheduler: TaskScheduler) -> Self {
        self.scheduler = scheduler;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn registry(&self) -> &Arc<CapabilityRegistry> {
        &self.registry
    }

    pub fn is_parallel(&self) -> bool {
        self.parallel
    }

    /// 执行一批调用。并行模式下所有调用并发执行，等待全部结束（join 屏障）后按请求顺序返回
    pub async fn dispatch(
        &self,
        requests: &[InvocationRequest],
        cancel: &CancellationToken,
    ) -> Result<Vec<InvocationResult>, DispatchError> {
        self.dispatch_tracked(requests, cancel, &InvocationTracker::new())
            .await
    }

    /// 同 dispatch，并把每个调用的完成情况记入 tracker
    pub async fn dispatch_tracked(
        &self,
        requests: &[InvocationRequest],
        cancel: &CancellationToken,
        tracker: &InvocationTracker,
    ) -> Result<Vec<InvocationResult>, DispatchError> {
        tracker.begin(requests);
        if self.parallel && requests.len() > 1 {
            join_all(requests.iter().map(|r| self.invoke_tracked(r, cancel, tracker)))
                .await
                .into_iter()
                .collect()
        } else {
            let mut results = Vec::with_capacity(requests.len());
            for request in requests {
                results.push(self.invoke_tracked(request, cancel, tracker).await?);
            }
            Ok(results)
        }
    }

    async fn invoke_tracked(
        &self,
        request: &InvocationRequest,
        cancel: &CancellationToken,
        tracker: &InvocationTracker,
    ) -> Result<InvocationResult, DispatchError> {
        let result = self.invoke_one(request, cancel).await?;
        tracker.complete(&result);
        Ok(result)
    }

    async fn invoke_one(
        &self,
        request: &InvocationRequest,
        cancel: &CancellationToken,
    ) -> Result<InvocationResult, DispatchError> {
        let (capability, args) = match self.registry.resolve(request) {
            Ok(resolved) => resolved,
            Err(RegistryError::NotFound(_)) => {
                audit(request, "not_found", 0);
                return Ok(InvocationResult::not_found(request));
            }
            Err(RegistryError::Validation(msg)) => {
                audit(request, "invalid_args", 0);
                return Ok(InvocationResult::capability_error(request, msg));
            }
        };

        let _permit = if self.parallel {
            Some(self.scheduler.acquire_tool().await?)
        } else {
            None
        };

        let ctx = InvocationContext::new(request.id.clone(), cancel.child_token());
        let start = Instant::now();
        let call = AssertUnwindSafe(capability.invoke(args, &ctx)).catch_unwind();

        let (result, outcome) = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => (
                InvocationResult::capability_error(request, "Invocation cancelled"),
                "cancelled",
            ),
            r = timeout(self.timeout, call) => match r {
                Ok(Ok(Ok(output))) => (InvocationResult::ok(request, output), "ok"),
                Ok(Ok(Err(e))) => (InvocationResult::capability_error(request, e), "error"),
                Ok(Err(panic)) => (
                    InvocationResult::capability_error(
                        request,
                        format!("Capability panicked: {}", panic_message(panic.as_ref())),
                    ),
                    "panic",
                ),
                Err(_) => (
                    InvocationResult::capability_error(
                        request,
                        format!("Invocation timed out after {}s", self.timeout.as_secs()),
                    ),
                    "timeout",
                ),
            },
        };

        audit(request, outcome, start.elapsed().as_millis() as u64);
        Ok(result)
    }
}

fn audit(request: &InvocationRequest, outcome: &str, duration_ms: u64) {
    let audit = serde_json::json!({
        "event": "tool_audit",
        "tool": request.name,
        "invocation_id": request.id,
        "ok": outcome == "ok",
        "outcome": outcome,
        "duration_ms": duration_ms,
        "args_preview": args_preview(&request.arguments_value()),
    });
    tracing::info!(audit = %audit.to_string(), "tool");
}

fn args_preview(args: &Value) -> String {
    let s = args.to_string();
    if s.len() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
