use std::future::Future;
use std::time::Duration;

use tokio::sync::broadcast::{self, error::TryRecvError};
use tracing::{debug, error, info};
use trellis_errors::TrellisResult;

/// 轮询循环：认领 → 处理 → 释放，没有可做的工作时休眠一个周期
///
/// `step` 返回 `Ok(true)` 表示刚处理完一个单元，立即再尝试；
/// `Ok(false)` 表示当前没有可认领的工作。出错时记录日志并休眠，不会在紧循环里重试。
/// 关闭信号只在两个单元之间检查，正在处理的单元不会被中途打断。
pub async fn run_polling_loop<F, Fut>(
    name: &str,
    period: Duration,
    mut shutdown_rx: broadcast::Receiver<()>,
    mut step: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = TrellisResult<bool>>,
{
    info!(loop_name = name, period_ms = period.as_millis() as u64, "启动轮询循环");

    loop {
        match shutdown_rx.try_recv() {
            Err(TryRecvError::Empty) => {}
            _ => break,
        }

        let idle = match step().await {
            Ok(true) => false,
            Ok(false) => true,
            Err(e) => {
                error!(loop_name = name, error = %e, "轮询循环单步执行失败");
                true
            }
        };

        if idle {
            debug!(loop_name = name, "暂无可认领的工作，进入休眠");
            tokio::select! {
                _ = tokio::time::sleep(period) => {}
                _ = shutdown_rx.recv() => break,
            }
        }
    }

    info!(loop_name = name, "轮询循环已退出");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use trellis_errors::TrellisError;

    #[tokio::test]
    async fn test_loop_exits_on_shutdown() {
        let (tx, rx) = broadcast::channel(1);
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let handle = tokio::spawn(async move {
            run_polling_loop("test", Duration::from_millis(5), rx, || {
                let counter = Arc::clone(&counter);
                async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst);
                    if n % 2 == 0 {
                        Ok(true)
                    } else if n % 3 == 0 {
                        Err(TrellisError::storage("暂时失败"))
                    } else {
                        Ok(false)
                    }
                }
            })
            .await;
        });

        tokio::time::sleep(Duration::from_millis(40)).await;
        tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();

        assert!(calls.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn test_loop_exits_when_sender_dropped() {
        let (tx, rx) = broadcast::channel::<()>(1);
        drop(tx);
        tokio::time::timeout(
            Duration::from_secs(1),
            run_polling_loop("closed", Duration::from_millis(5), rx, || async { Ok(false) }),
        )
        .await
        .unwrap();
    }
}
