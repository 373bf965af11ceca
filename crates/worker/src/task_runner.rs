use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{error, info, warn};

use trellis_core::run_polling_loop;
use trellis_domain::pipeline::next_stage;
use trellis_domain::query::{FieldKind, SortOrder};
use trellis_domain::{
    Filter, Identity, ProcessStatus, SortSpec, Stage, StageReport, Task, TaskPatch, TaskStatus,
};
use trellis_errors::TrellisResult;

use crate::context::WorkerContext;
use crate::executors::StageExecutor;

/// 认领已调度的任务，逐阶段执行到结束
///
/// 每个阶段开始前重新读取任务状态：暂停中的任务在此停下并转为已暂停，
/// 终止中的任务转为已终止。阶段执行期间不持有任何进程内锁。
///
/// 未上锁的运行中任务来自已死亡的工作进程，同样会被认领并从当前阶段重新执行。
pub struct TaskRunner {
    ctx: WorkerContext,
    executor: Arc<dyn StageExecutor>,
}

impl TaskRunner {
    pub fn new(ctx: WorkerContext, executor: Arc<dyn StageExecutor>) -> Self {
        Self { ctx, executor }
    }

    pub async fn process_next(&self) -> TrellisResult<bool> {
        let task = match self
            .ctx
            .engine
            .locks
            .claim::<Task>(
                &Identity::root(),
                vec![Filter::status_in(&[TaskStatus::Scheduled, TaskStatus::Running])],
                &SortSpec::by("creation-time", FieldKind::Timestamp, SortOrder::Asc),
                &self.ctx.process_id,
            )
            .await
        {
            Ok(task) => task,
            Err(e) if e.is_not_found() => return Ok(false),
            Err(e) => return Err(e),
        };

        info!(task_id = %task.id, job_id = %task.job, stage = %task.stage, "认领任务");
        self.ctx.mark_process(ProcessStatus::Working).await;
        let result = self.run_task(&task.id).await;
        self.ctx.mark_process(ProcessStatus::Idle).await;
        result.map(|_| true)
    }

    async fn run_task(&self, id: &str) -> TrellisResult<()> {
        let root = Identity::root();
        let tasks = &self.ctx.engine.tasks;

        loop {
            let task = self.ctx.bookkeep("read-task", || tasks.get(&root, id)).await?;

            match task.status {
                TaskStatus::Scheduled => {
                    self.set_status(id, TaskStatus::Running, "").await?;
                    continue;
                }
                TaskStatus::Running => {}
                TaskStatus::Pausing => {
                    self.set_status(id, TaskStatus::Paused, "").await?;
                    info!(task_id = id, stage = %task.stage, "任务已暂停");
                    return self.release(id).await;
                }
                TaskStatus::Terminating => {
                    self.set_status(id, TaskStatus::Terminated, "").await?;
                    info!(task_id = id, stage = %task.stage, "任务已终止");
                    return Ok(());
                }
                TaskStatus::Error => {
                    warn!(task_id = id, "任务已处于出错状态，保留锁");
                    return Ok(());
                }
                other => {
                    warn!(task_id = id, status = %other, "任务已结束，停止执行");
                    return self.release(id).await;
                }
            }

            match task.stage {
                Stage::End => return self.complete(&task).await,
                Stage::Begin => {
                    self.advance(&task, StageReport::default()).await?;
                }
                stage => match self.executor.execute(&task, stage).await {
                    Ok(report)
                        if report
                            .alt_qualities
                            .as_ref()
                            .is_some_and(|q| q.len() != task.alt_objectives.len()) =>
                    {
                        let message = format!(
                            "阶段 {stage} 给出的 alt-qualities 数量与 alt-objectives 数量 {} 不一致",
                            task.alt_objectives.len()
                        );
                        error!(task_id = id, stage = %stage, "{message}");
                        return self.set_status(id, TaskStatus::Error, &message).await;
                    }
                    Ok(report) => {
                        metrics::counter!("trellis_stages_executed_total", "stage" => stage.as_str())
                            .increment(1);
                        self.advance(&task, report).await?;
                    }
                    Err(e) => {
                        // 出错的任务保持上锁，留给人工排查
                        error!(task_id = id, stage = %stage, error = %e, "任务阶段执行失败");
                        return self.set_status(id, TaskStatus::Error, &e.to_string()).await;
                    }
                },
            }
        }
    }

    /// 写入阶段结果并进入下一阶段，同一次写入完成
    ///
    /// 目标阶段在重试前确定，重复写入同一阶段不会跳过后续阶段。
    async fn advance(&self, task: &Task, report: StageReport) -> TrellisResult<()> {
        let root = Identity::root();
        let engine = &self.ctx.engine;
        let job = self
            .ctx
            .bookkeep("read-job", || engine.jobs.get(&root, &task.job))
            .await?;
        let next = next_stage(task.stage, &job.pipeline);

        let patch = TaskPatch {
            quality: report.quality,
            quality_train: report.quality_train,
            alt_qualities: report.alt_qualities,
            stage: Some(next),
            ..Default::default()
        };
        self.ctx
            .bookkeep("advance-task", || engine.tasks.update(&root, &task.id, patch.clone()))
            .await?;
        info!(task_id = %task.id, from = %task.stage, to = %next, "任务进入下一阶段");
        Ok(())
    }

    async fn complete(&self, task: &Task) -> TrellisResult<()> {
        self.set_status(&task.id, TaskStatus::Completed, "").await?;
        metrics::counter!("trellis_tasks_completed_total").increment(1);

        let jobs = &self.ctx.engine.jobs;
        let finished = self
            .ctx
            .bookkeep("complete-job", || jobs.complete_if_quota_reached(&task.job))
            .await?;
        if finished {
            info!(job_id = %task.job, "作业完成任务数达到上限");
        }
        Ok(())
    }

    async fn set_status(&self, id: &str, status: TaskStatus, message: &str) -> TrellisResult<()> {
        let root = Identity::root();
        let tasks = &self.ctx.engine.tasks;
        self.ctx
            .bookkeep("update-task-status", || tasks.set_status(&root, id, status, message))
            .await
            .map(|_| ())
    }

    async fn release(&self, id: &str) -> TrellisResult<()> {
        let root = Identity::root();
        let owner = self.ctx.process_id.as_str();
        let locks = &self.ctx.engine.locks;
        self.ctx
            .bookkeep("release-task", || locks.release::<Task>(&root, id, owner))
            .await?;
        metrics::counter!("trellis_releases_total", "collection" => "tasks").increment(1);
        Ok(())
    }

    pub async fn run(&self, shutdown_rx: broadcast::Receiver<()>) {
        run_polling_loop("task-runner", self.ctx.poll_period, shutdown_rx, || {
            self.process_next()
        })
        .await;
    }
}
