//! LLM 客户端抽象
//!
//! 所有文本后端（OpenAI 兼容 / Mock）实现 LlmClient：输入有序 Turn，输出模型回复文本。
//! 是否包含调用请求由上层 LlmPort 解析决定。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::memory::Turn;

/// Reasoning 服务错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LlmError {
    /// 输入超出服务可接受的上下文长度
    #[error("context length exceeded: {0}")]
    ContextOverflow(String),

    /// 回复无法解析
    #[error("malformed response: {0}")]
    Protocol(String),

    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("request failed: {0}")]
    Request(String),
}

impl LlmError {
    /// 限流与请求失败可以原样重发；溢出与协议错误重发无意义
    pub fn is_transient(&self) -> bool {
        matches!(self, LlmError::RateLimited { .. } | LlmError::Request(_))
    }
}

/// LLM 客户端 trait
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// 非流式完成
    async fn complete(&self, turns: &[Turn]) -> Result<String, LlmError>;

    /// 获取累计 token 使用统计：(prompt_tokens, completion_tokens, total_tokens)
    /// 默认返回 (0, 0, 0)，具体实现可覆盖
    fn token_usage(&self) -> (u64, u64, u64) {
        (0, 0, 0)
    }
}

/// 瞬时错误的重试配置（指数退避）
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: usize,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    pub fn with_max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// 第 attempt 次重试前的等待（从 0 开始）
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let base = self.initial_delay.as_millis() as f64 * self.backoff_multiplier.powi(attempt as i32);
        Duration::from_millis(base.min(self.max_delay.as_millis() as f64) as u64)
    }
}

/// 给任意 LlmClient 套上瞬时错误重试
pub struct RetryingLlmClient {
    inner: Arc<dyn LlmClient>,
    config: RetryConfig,
}

impl RetryingLlmClient {
    pub fn new(inner: Arc<dyn LlmClient>, config: RetryConfig) -> Self {
        Self { inner, config }
    }
}

#[async_trait]
impl LlmClient for RetryingLlmClient {
    async fn complete(&self, turns: &[Turn]) -> Result<String, LlmError> {
        let mut attempt = 0;
        loop {
            match self.inner.complete(turns).await {
                Ok(text) => return Ok(text),
                Err(e) if e.is_transient() && attempt + 1 < self.config.max_attempts => {
                    let delay = match &e {
                        LlmError::RateLimited { retry_after_ms } => {
                            Duration::from_millis(*retry_after_ms)
                                .max(self.config.delay_for_attempt(attempt))
                        }
                        _ => self.config.delay_for_attempt(attempt),
                    };
                    tracing::warn!(attempt, error = %e, delay_ms = delay.as_millis() as u64, "LLM request failed, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn token_usage(&self) -> (u64, u64, u64) {
        self.inner.token_usage()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Flaky {
        failures: usize,
        error: LlmError,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl LlmClient for Flaky {
        async fn complete(&self, _turns: &[Turn]) -> Result<String, LlmError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                Err(self.error.clone())
            } else {
                Ok("ok".to_string())
            }
        }
    }

    fn fast() -> RetryConfig {
        RetryConfig::default().with_initial_delay(Duration::from_millis(1))
    }

    #[tokio::test]
    async fn test_retries_transient_errors() {
        let inner = Arc::new(Flaky {
            failures: 2,
            error: LlmError::Request("503".into()),
            calls: AtomicUsize::new(0),
        });
        let client = RetryingLlmClient::new(inner.clone(), fast());
        assert_eq!(client.complete(&[]).await.unwrap(), "ok");
        assert_eq!(inner.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_overflow_is_not_retried() {
        let inner = Arc::new(Flaky {
            failures: 1,
            error: LlmError::ContextOverflow("too long".into()),
            calls: AtomicUsize::new(0),
        });
        let client = RetryingLlmClient::new(inner.clone(), fast());
        let err = client.complete(&[]).await.unwrap_err();
        assert!(matches!(err, LlmError::ContextOverflow(_)));
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let inner = Arc::new(Flaky {
            failures: 10,
            error: LlmError::RateLimited { retry_after_ms: 1 },
            calls: AtomicUsize::new(0),
        });
        let client = RetryingLlmClient::new(inner.clone(), fast().with_max_attempts(2));
        assert!(client.complete(&[]).await.is_err());
        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_delay_is_capped() {
        let cfg = RetryConfig::default();
        assert_eq!(cfg.delay_for_attempt(0), Duration::from_millis(500));
        assert_eq!(cfg.delay_for_attempt(1), Duration::from_millis(1000));
        assert_eq!(cfg.delay_for_attempt(20), Duration::from_secs(30));
    }
}
