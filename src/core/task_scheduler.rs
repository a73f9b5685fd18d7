//! 任务调度：工具并发池
//!
//! 并行分发时，每个能力调用先从 Semaphore 获取许可再执行，限制同时在跑的调用数。

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::tools::DispatchError;

/// 工具并发调度器
#[derive(Debug, Clone)]
pub struct TaskScheduler {
    /// 工具并发限制（默认 3）
    tool_semaphore: Arc<Semaphore>,
}

impl TaskScheduler {
    pub fn new(max_concurrent_tools: usize) -> Self {
        Self {
            tool_semaphore: Arc::new(Semaphore::new(max_concurrent_tools.max(1))),
        }
    }

    /// 获取工具执行许可；调度器已关闭属于分发器自身故障
    pub async fn acquire_tool(&self) -> Result<OwnedSemaphorePermit, DispatchError> {
        self.tool_semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| DispatchError::SchedulerClosed)
    }

    /// 当前可用许可数
    pub fn available(&self) -> usize {
        self.tool_semaphore.available_permits()
    }

    /// 关闭调度器：之后的 acquire_tool 全部失败
    pub fn close(&self) {
        self.tool_semaphore.close();
    }
}

impl Default for TaskScheduler {
    fn default() -> Self {
        Self::new(3)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_permits_are_bounded() {
        let sched = TaskScheduler::new(2);
        let a = sched.acquire_tool().await.unwrap();
        let _b = sched.acquire_tool().await.unwrap();
        assert_eq!(sched.available(), 0);
        drop(a);
        assert_eq!(sched.available(), 1);
    }

    #[tokio::test]
    async fn test_closed_scheduler_errors() {
        let sched = TaskScheduler::new(1);
        sched.close();
        assert!(matches!(
            sched.acquire_tool().await,
            Err(DispatchError::SchedulerClosed)
        ));
    }

    #[test]
    fn test_zero_is_clamped() {
        assert_eq!(TaskScheduler::new(0).available(), 1);
    }
}
