use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use tracing::{debug, info};
use trellis_errors::{ErrorKind, TrellisError, TrellisResult};

use crate::entities::{Job, JobStatus, StageTimes, Task, TaskStatus};
use crate::patches::{parse_patch, TaskPatch};
use crate::pipeline::{next_stage, Stage};
use crate::query::{Filter, Identity, ListQuery, Page};
use crate::repositories::DocumentUpdate;
use crate::schema::compact_json;
use crate::services::repository::Repository;
use crate::services::{referenced, update_with_retry};
use crate::state_machine::{StateMachine, Transition};

// 任务编号按已有任务数生成，并发创建撞号时重新计数
const MAX_ID_ATTEMPTS: u64 = 8;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct NewTask {
    pub job: String,
    pub model: String,
    /// 超参数配置，JSON 文本
    pub config: String,
    pub quality_expected: Option<f64>,
}

/// 阶段执行结果中需要回写的质量指标
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StageReport {
    pub quality: Option<f64>,
    pub quality_train: Option<f64>,
    pub alt_qualities: Option<Vec<f64>>,
}

#[derive(Clone)]
pub struct TaskService {
    tasks: Repository<Task>,
    jobs: Repository<Job>,
}

impl TaskService {
    pub fn new(tasks: Repository<Task>, jobs: Repository<Job>) -> Self {
        Self { tasks, jobs }
    }

    /// 在运行中的作业下创建任务，用户、数据集、目标与流水线从作业复制
    pub async fn create(&self, identity: &Identity, new: NewTask) -> TrellisResult<Task> {
        let job = referenced(self.jobs.get(identity, &new.job).await, "作业")?;
        if job.status != JobStatus::Running {
            return Err(TrellisError::bad_input(format!(
                "作业 {} 当前状态为 {}，只能在运行中的作业下创建任务",
                job.id, job.status
            )));
        }
        if !job.models.contains(&new.model) {
            return Err(TrellisError::bad_input(format!(
                "模型 {} 不属于作业 {}",
                new.model, job.id
            )));
        }
        let config = if new.config.is_empty() {
            String::new()
        } else {
            compact_json(&new.config)?
        };

        let root = Identity::root();
        for attempt in 0..MAX_ID_ATTEMPTS {
            let existing = self
                .tasks
                .count(&root, vec![Filter::eq("job", job.id.as_str())])
                .await?;
            let task = Task {
                id: format!("{}/{:010}", job.id, existing + 1 + attempt),
                job: job.id.clone(),
                process: None,
                user: job.user.clone(),
                dataset: job.dataset.clone(),
                model: new.model.clone(),
                objective: job.objective.clone(),
                alt_objectives: job.alt_objectives.clone(),
                config: config.clone(),
                quality: None,
                quality_train: None,
                quality_expected: new.quality_expected,
                alt_qualities: vec![0.0; job.alt_objectives.len()],
                status: TaskStatus::Scheduled,
                status_message: String::new(),
                stage: Stage::Begin,
                pipeline: job.pipeline.clone(),
                stage_times: StageTimes::default(),
                creation_time: Utc::now(),
            };

            match self.tasks.insert(&task).await {
                Ok(created) => {
                    info!(task_id = %created.value.id, job_id = %job.id, model = %task.model, "创建任务");
                    return Ok(created.value);
                }
                Err(e) if e.kind() == ErrorKind::IdentifierTaken => {
                    debug!(task_id = %task.id, attempt, "任务编号已被占用，重新计数");
                }
                Err(e) => return Err(e),
            }
        }

        Err(TrellisError::identifier_taken(format!(
            "作业 {} 下的任务编号持续冲突",
            job.id
        )))
    }

    pub async fn get(&self, identity: &Identity, id: &str) -> TrellisResult<Task> {
        self.tasks.get(identity, id).await
    }

    pub async fn list(&self, identity: &Identity, query: &ListQuery) -> TrellisResult<Page<Task>> {
        self.tasks.list(identity, query, vec![], None).await
    }

    pub async fn update(&self, identity: &Identity, id: &str, patch: TaskPatch) -> TrellisResult<Task> {
        let now = Utc::now();
        let (updated, _) = update_with_retry(&self.tasks, identity, id, |current| {
            let mut update = DocumentUpdate::new();
            if let Some(quality) = patch.quality {
                update = update.set("quality", quality);
            }
            if let Some(quality) = patch.quality_train {
                update = update.set("quality-train", quality);
            }
            if let Some(quality) = patch.quality_expected {
                update = update.set("quality-expected", quality);
            }
            if let Some(qualities) = &patch.alt_qualities {
                if qualities.len() != current.alt_objectives.len() {
                    return Err(TrellisError::bad_input(format!(
                        "alt-qualities 长度 {} 与 alt-objectives 长度 {} 不一致",
                        qualities.len(),
                        current.alt_objectives.len()
                    )));
                }
                update = update.set("alt-qualities", json!(qualities));
            }
            if let Some(message) = &patch.status_message {
                update = update.set("status-message", message.as_str());
            }
            if let Some(stage) = patch.stage {
                update = stage_change(update, current, stage, now)?;
            }
            if let Some(status) = patch.status {
                update = task_transition(update, current, status, now)?;
            }
            Ok(update)
        })
        .await?;

        if let Some(status) = patch.status {
            debug!(task_id = id, status = %status, "更新任务状态");
        }
        Ok(updated)
    }

    pub async fn update_fields(
        &self,
        identity: &Identity,
        id: &str,
        fields: Map<String, Value>,
    ) -> TrellisResult<Task> {
        self.update(identity, id, parse_patch(fields)?).await
    }

    pub async fn set_status(
        &self,
        identity: &Identity,
        id: &str,
        status: TaskStatus,
        message: &str,
    ) -> TrellisResult<Task> {
        self.update(identity, id, TaskPatch::status(status, message))
            .await
    }

    /// 推进到作业流水线中的下一阶段，记录旧阶段结束与新阶段开始时间
    pub async fn advance_stage(&self, identity: &Identity, id: &str) -> TrellisResult<Task> {
        let task = self.tasks.get(identity, id).await?;
        let job = self.jobs.get(&Identity::root(), &task.job).await?;
        let next = next_stage(task.stage, &job.pipeline);
        debug!(task_id = id, from = %task.stage, to = %next, "推进任务阶段");
        self.update(
            identity,
            id,
            TaskPatch {
                stage: Some(next),
                ..Default::default()
            },
        )
        .await
    }

    /// 回写阶段产出的质量指标
    pub async fn record_report(&self, identity: &Identity, id: &str, report: StageReport) -> TrellisResult<Task> {
        self.update(
            identity,
            id,
            TaskPatch {
                quality: report.quality,
                quality_train: report.quality_train,
                alt_qualities: report.alt_qualities,
                ..Default::default()
            },
        )
        .await
    }

    pub async fn pause_tasks_of_job(&self, job_id: &str) -> TrellisResult<u64> {
        bulk_task_transition(&self.tasks, job_id, TaskStatus::Pausing).await
    }

    pub async fn resume_tasks_of_job(&self, job_id: &str) -> TrellisResult<u64> {
        bulk_task_transition(&self.tasks, job_id, TaskStatus::Scheduled).await
    }

    pub async fn terminate_tasks_of_job(&self, job_id: &str) -> TrellisResult<u64> {
        bulk_task_transition(&self.tasks, job_id, TaskStatus::Terminating).await
    }

    pub async fn count_completed(&self, job_id: &str) -> TrellisResult<u64> {
        self.tasks
            .count(
                &Identity::root(),
                vec![Filter::eq("job", job_id), Filter::status(TaskStatus::Completed)],
            )
            .await
    }
}

/// 把作业下所有能一步迁移到 `target` 的任务改为 `target`
pub(crate) async fn bulk_task_transition(
    tasks: &Repository<Task>,
    job_id: &str,
    target: TaskStatus,
) -> TrellisResult<u64> {
    let sources = TaskStatus::predecessors(target);
    let mut update = DocumentUpdate::new().set("status", target.as_str());
    if target.releases_lock() {
        update = update.set("process", Value::Null);
    }

    let changed = tasks
        .update_all(
            &Identity::root(),
            vec![Filter::eq("job", job_id), Filter::status_in(sources.as_slice())],
            &update,
        )
        .await?;
    debug!(job_id, target = %target, changed, "批量迁移任务状态");
    Ok(changed)
}

fn stage_times_path(stage: Stage, edge: &str) -> String {
    format!("stage-times.{}.{edge}", stage.as_str())
}

/// 阶段在流水线中的位置：开始为 0，结束排在所有流水线阶段之后
fn stage_position(stage: Stage, pipeline: &[Stage]) -> Option<usize> {
    match stage {
        Stage::Begin => Some(0),
        Stage::End => Some(pipeline.len() + 1),
        _ => pipeline.iter().position(|s| *s == stage).map(|i| i + 1),
    }
}

fn stage_change(
    update: DocumentUpdate,
    current: &Task,
    stage: Stage,
    now: DateTime<Utc>,
) -> TrellisResult<DocumentUpdate> {
    if stage == current.stage {
        return Ok(update);
    }
    let Some(target) = stage_position(stage, &current.pipeline).filter(|_| stage != Stage::Begin)
    else {
        return Err(TrellisError::bad_input(format!(
            "任务 {} 的流水线中没有阶段 {stage}",
            current.id
        )));
    };
    // 阶段只能沿流水线向后移动，结束后不再变化
    let from = stage_position(current.stage, &current.pipeline).unwrap_or(0);
    if target <= from {
        return Err(TrellisError::bad_input(format!(
            "任务 {} 不能从阶段 {} 回到阶段 {stage}",
            current.id, current.stage
        )));
    }

    let now_ms = now.timestamp_millis();
    let mut update = update.set("stage", stage.as_str());
    if current.stage.is_pipeline_element() {
        update = update.set(stage_times_path(current.stage, "end"), now_ms);
    }
    if stage.is_pipeline_element() {
        update = update.set(stage_times_path(stage, "start"), now_ms);
    }
    Ok(update)
}

/// 出错时补记当前阶段的结束时间；完成、终止、取消时释放锁
fn task_transition(
    update: DocumentUpdate,
    current: &Task,
    status: TaskStatus,
    now: DateTime<Utc>,
) -> TrellisResult<DocumentUpdate> {
    if current.status.validate_transition(status)? == Transition::Unchanged {
        return Ok(update);
    }

    let mut update = update.set("status", status.as_str());
    match status {
        TaskStatus::Error => {
            let open = current
                .stage_times
                .get(current.stage)
                .is_some_and(|interval| interval.end.is_none());
            if open {
                update = update.set(stage_times_path(current.stage, "end"), now.timestamp_millis());
            }
        }
        TaskStatus::Scheduled
        | TaskStatus::Running
        | TaskStatus::Pausing
        | TaskStatus::Paused
        | TaskStatus::Completed
        | TaskStatus::Terminating
        | TaskStatus::Terminated
        | TaskStatus::Canceled => {}
    }

    if status.releases_lock() {
        update = update.set("process", Value::Null);
    }
    Ok(update)
}
