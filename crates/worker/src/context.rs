use std::future::Future;
use std::time::Duration;

use trellis_core::{repeat_until_success, RetryConfig};
use trellis_domain::{ProcessStatus, ResourceEngine};
use trellis_errors::TrellisResult;
use tracing::warn;

/// 工作进程各循环共享的只读上下文
#[derive(Clone)]
pub struct WorkerContext {
    pub engine: ResourceEngine,
    /// 本进程在进程表中的标识，也是认领资源时写入的锁持有者
    pub process_id: String,
    /// 没有可认领的工作时的休眠周期
    pub poll_period: Duration,
    pub retry: RetryConfig,
}

impl WorkerContext {
    pub fn new(
        engine: ResourceEngine,
        process_id: impl Into<String>,
        poll_period: Duration,
        retry: RetryConfig,
    ) -> Self {
        Self {
            engine,
            process_id: process_id.into(),
            poll_period,
            retry,
        }
    }

    /// 工作完成后的簿记步骤，存储瞬时故障时一直重试
    pub async fn bookkeep<T, F, Fut>(&self, operation: &str, f: F) -> TrellisResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = TrellisResult<T>>,
    {
        repeat_until_success(&self.retry, operation, f).await
    }

    /// 更新本进程的忙闲状态，失败只记录日志
    pub async fn mark_process(&self, status: ProcessStatus) {
        if let Err(e) = self
            .engine
            .processes
            .set_status(&self.process_id, status)
            .await
        {
            warn!(process_id = %self.process_id, status = %status, error = %e, "更新进程状态失败");
        }
    }
}
