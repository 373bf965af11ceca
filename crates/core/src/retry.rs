use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{error, info, warn};
use trellis_errors::TrellisResult;

/// 簿记重试配置
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub default_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            default_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    pub fn next_delay(&self, current: Duration) -> Duration {
        current.mul_f64(self.backoff_multiplier).min(self.max_delay)
    }

    fn with_jitter(&self, delay: Duration) -> Duration {
        let jitter_ms = (delay.as_millis() as u64) / 10;
        if jitter_ms == 0 {
            return delay;
        }
        delay + Duration::from_millis(rand::rng().random_range(0..=jitter_ms))
    }
}

/// 反复执行一个簿记步骤直到成功
///
/// 存储层的瞬时故障无限重试；资源不存在、非法迁移等错误立即返回给调用方。
pub async fn repeat_until_success<T, F, Fut>(
    config: &RetryConfig,
    operation: &str,
    mut f: F,
) -> TrellisResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = TrellisResult<T>>,
{
    let mut delay = config.default_delay;
    let mut attempt: u32 = 0;

    loop {
        match f().await {
            Ok(value) => {
                if attempt > 0 {
                    info!(operation, attempt, "簿记操作重试后成功");
                }
                return Ok(value);
            }
            Err(e) if e.is_retryable() => {
                attempt += 1;
                metrics::counter!(
                    "trellis_bookkeeping_retries_total",
                    "operation" => operation.to_string()
                )
                .increment(1);
                warn!(
                    operation,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "簿记操作失败，等待后重试"
                );
                tokio::time::sleep(config.with_jitter(delay)).await;
                delay = config.next_delay(delay);
            }
            Err(e) => {
                error!(operation, error = %e, "簿记操作遇到不可重试的错误");
                return Err(e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use trellis_errors::{ErrorKind, TrellisError};

    fn fast_config() -> RetryConfig {
        RetryConfig {
            default_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
            backoff_multiplier: 2.0,
        }
    }

    #[test]
    fn test_next_delay_is_capped() {
        let config = RetryConfig::default();
        assert_eq!(config.next_delay(Duration::from_secs(1)), Duration::from_secs(2));
        assert_eq!(config.next_delay(Duration::from_secs(40)), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_retries_transient_errors_until_success() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&attempts);

        let result = repeat_until_success(&fast_config(), "unlock", || {
            let counter = Arc::clone(&counter);
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 3 {
                    Err(TrellisError::storage("数据库暂时不可用"))
                } else {
                    Ok(42)
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(result, 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_non_retryable_error_returns_immediately() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&attempts);

        let err = repeat_until_success(&fast_config(), "update-status", || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(TrellisError::not_found("task"))
            }
        })
        .await
        .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
