use tokio::sync::broadcast;
use tracing::{info, warn};

use trellis_core::run_polling_loop;
use trellis_domain::query::{FieldKind, SortOrder};
use trellis_domain::{Filter, Identity, Job, JobStatus, ProcessStatus, SortSpec};
use trellis_errors::TrellisResult;

use crate::context::ControllerContext;

const PENDING_STATUSES: [JobStatus; 3] = [
    JobStatus::Pausing,
    JobStatus::Resuming,
    JobStatus::Terminating,
];

/// 把处于过渡状态的作业推进到稳定状态
///
/// 暂停中的作业先把其下的任务批量置为暂停中，再进入已暂停；恢复中与终止中同理。
pub struct JobStatusMaintainer {
    ctx: ControllerContext,
}

impl JobStatusMaintainer {
    pub fn new(ctx: ControllerContext) -> Self {
        Self { ctx }
    }

    /// 认领并处理一个作业，没有可处理的作业时返回 `false`
    pub async fn process_next(&self) -> TrellisResult<bool> {
        let root = Identity::root();
        let job = match self
            .ctx
            .engine
            .locks
            .claim::<Job>(
                &root,
                vec![Filter::status_in(&PENDING_STATUSES[..])],
                &SortSpec::by("creation-time", FieldKind::Timestamp, SortOrder::Asc),
                &self.ctx.process_id,
            )
            .await
        {
            Ok(job) => job,
            Err(e) if e.is_not_found() => return Ok(false),
            Err(e) => return Err(e),
        };

        self.ctx.mark_process(ProcessStatus::Working).await;
        let result = self.settle(&job).await;
        self.ctx.mark_process(ProcessStatus::Idle).await;
        result.map(|_| true)
    }

    async fn settle(&self, job: &Job) -> TrellisResult<()> {
        let engine = &self.ctx.engine;
        let job_id = job.id.as_str();

        let (changed, target) = match job.status {
            JobStatus::Pausing => (
                self.ctx
                    .bookkeep("pause-tasks", move || engine.tasks.pause_tasks_of_job(job_id))
                    .await?,
                JobStatus::Paused,
            ),
            JobStatus::Resuming => (
                self.ctx
                    .bookkeep("resume-tasks", move || engine.tasks.resume_tasks_of_job(job_id))
                    .await?,
                JobStatus::Running,
            ),
            JobStatus::Terminating => (
                self.ctx
                    .bookkeep("terminate-tasks", move || {
                        engine.tasks.terminate_tasks_of_job(job_id)
                    })
                    .await?,
                JobStatus::Terminated,
            ),
            other => {
                warn!(job_id, status = %other, "认领到不需要维护的作业，直接释放");
                return self.release(job_id).await;
            }
        };

        let root = Identity::root();
        self.ctx
            .bookkeep("update-job-status", || {
                engine.jobs.set_status(&root, job_id, target, "")
            })
            .await?;
        info!(job_id, from = %job.status, to = %target, tasks = changed, "作业状态维护完成");

        self.release(job_id).await
    }

    async fn release(&self, job_id: &str) -> TrellisResult<()> {
        let root = Identity::root();
        let owner = self.ctx.process_id.as_str();
        let locks = &self.ctx.engine.locks;
        self.ctx
            .bookkeep("release-job", || locks.release::<Job>(&root, job_id, owner))
            .await?;
        metrics::counter!("trellis_releases_total", "collection" => "jobs").increment(1);
        Ok(())
    }

    pub async fn run(&self, shutdown_rx: broadcast::Receiver<()>) {
        run_polling_loop(
            "job-status-maintainer",
            self.ctx.poll_period,
            shutdown_rx,
            || self.process_next(),
        )
        .await;
    }
}
