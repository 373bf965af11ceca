use tokio::sync::broadcast;
use tracing::info;

use trellis_core::run_polling_loop;
use trellis_domain::query::{FieldKind, SortOrder};
use trellis_domain::{Filter, Identity, SortSpec, Task, TaskStatus};
use trellis_errors::TrellisResult;

use crate::context::WorkerContext;

/// 处理没有被执行循环持有的暂停中、终止中任务
///
/// 正在执行的任务由持有它的执行循环在阶段之间处理，这里只认领未上锁的任务。
pub struct TaskStatusMaintainer {
    ctx: WorkerContext,
}

impl TaskStatusMaintainer {
    pub fn new(ctx: WorkerContext) -> Self {
        Self { ctx }
    }

    pub async fn process_next(&self) -> TrellisResult<bool> {
        let root = Identity::root();
        let task = match self
            .ctx
            .engine
            .locks
            .claim::<Task>(
                &root,
                vec![Filter::status_in(&[TaskStatus::Pausing, TaskStatus::Terminating])],
                &SortSpec::by("creation-time", FieldKind::Timestamp, SortOrder::Asc),
                &self.ctx.process_id,
            )
            .await
        {
            Ok(task) => task,
            Err(e) if e.is_not_found() => return Ok(false),
            Err(e) => return Err(e),
        };

        let target = match task.status {
            TaskStatus::Pausing => TaskStatus::Paused,
            _ => TaskStatus::Terminated,
        };
        let tasks = &self.ctx.engine.tasks;
        let id = task.id.as_str();
        self.ctx
            .bookkeep("update-task-status", || tasks.set_status(&root, id, target, ""))
            .await?;
        info!(task_id = id, from = %task.status, to = %target, "任务状态维护完成");

        // 已终止会在状态写入时释放锁，已暂停需要显式释放
        let owner = self.ctx.process_id.as_str();
        let locks = &self.ctx.engine.locks;
        self.ctx
            .bookkeep("release-task", || locks.release::<Task>(&root, id, owner))
            .await?;
        Ok(true)
    }

    pub async fn run(&self, shutdown_rx: broadcast::Receiver<()>) {
        run_polling_loop("task-status-maintainer", self.ctx.poll_period, shutdown_rx, || {
            self.process_next()
        })
        .await;
    }
}
