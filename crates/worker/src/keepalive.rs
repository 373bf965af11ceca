use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use trellis_domain::ProcessRegistry;
use trellis_errors::TrellisResult;

/// 周期性刷新本进程的保活时间
pub struct KeepaliveManager {
    processes: ProcessRegistry,
    process_id: String,
    keepalive_interval: Duration,
}

impl KeepaliveManager {
    pub fn new(processes: ProcessRegistry, process_id: impl Into<String>, keepalive_interval: Duration) -> Self {
        Self {
            processes,
            process_id: process_id.into(),
            keepalive_interval,
        }
    }

    /// 运行到收到关闭信号为止
    ///
    /// 本进程已被判定死亡时返回 `NotFound`：它持有的锁已被回收，调用方应当退出。
    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) -> TrellisResult<()> {
        let mut ticker = interval(self.keepalive_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.processes.keepalive(&self.process_id).await {
                        Ok(_) => debug!(process_id = %self.process_id, "保活"),
                        Err(e) if e.is_not_found() => {
                            error!(process_id = %self.process_id, "本进程已被判定死亡，停止保活");
                            return Err(e);
                        }
                        Err(e) => warn!(process_id = %self.process_id, error = %e, "保活失败"),
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!(process_id = %self.process_id, "保活任务退出");
                    return Ok(());
                }
            }
        }
    }
}
