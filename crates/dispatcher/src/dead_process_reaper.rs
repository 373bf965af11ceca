use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::broadcast;
use tracing::{debug, info};

use trellis_core::run_polling_loop;
use trellis_domain::{ProcessRegistry, ReclaimedProcess};
use trellis_errors::{TrellisError, TrellisResult};

/// 死亡进程回收配置
#[derive(Debug, Clone)]
pub struct DeadProcessReaperConfig {
    /// 检测间隔
    pub detection_interval: Duration,
    /// 保活时间早于 `now - dead_cutoff` 的进程判定为死亡
    pub dead_cutoff: Duration,
}

impl Default for DeadProcessReaperConfig {
    fn default() -> Self {
        Self {
            detection_interval: Duration::from_secs(30),
            dead_cutoff: Duration::from_secs(150),
        }
    }
}

/// 周期性地回收保活超时的进程及其持有的锁
pub struct DeadProcessReaper {
    processes: ProcessRegistry,
    config: DeadProcessReaperConfig,
    running: Arc<tokio::sync::RwLock<bool>>,
}

impl DeadProcessReaper {
    pub fn new(processes: ProcessRegistry, config: Option<DeadProcessReaperConfig>) -> Self {
        Self {
            processes,
            config: config.unwrap_or_default(),
            running: Arc::new(tokio::sync::RwLock::new(false)),
        }
    }

    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }

    /// 执行一轮回收
    pub async fn reap_once(&self) -> TrellisResult<Vec<ReclaimedProcess>> {
        let cutoff = chrono::Duration::from_std(self.config.dead_cutoff)
            .map_err(|e| TrellisError::config_error(format!("死亡判定时长无效: {e}")))?;
        let reclaimed = self.processes.reclaim_dead(Utc::now() - cutoff).await?;

        if reclaimed.is_empty() {
            debug!("没有保活超时的进程");
        } else {
            let locks: u64 = reclaimed.iter().map(|r| r.released.total()).sum();
            metrics::counter!("trellis_reclaimed_locks_total").increment(locks);
            info!(processes = reclaimed.len(), locks, "回收死亡进程完成");
        }
        Ok(reclaimed)
    }

    /// 运行回收循环直到收到关闭信号
    pub async fn run(&self, shutdown_rx: broadcast::Receiver<()>) {
        {
            let mut running = self.running.write().await;
            *running = true;
        }
        info!(
            interval_secs = self.config.detection_interval.as_secs(),
            cutoff_secs = self.config.dead_cutoff.as_secs(),
            "启动死亡进程回收"
        );

        run_polling_loop(
            "dead-process-reaper",
            self.config.detection_interval,
            shutdown_rx,
            || async move { self.reap_once().await.map(|_| false) },
        )
        .await;

        let mut running = self.running.write().await;
        *running = false;
    }
}
