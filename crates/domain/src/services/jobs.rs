use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use tracing::{debug, info};
use trellis_errors::{ErrorKind, TrellisError, TrellisResult};

use crate::entities::{
    DatasetStatus, Job, JobStatus, Module, ModuleStatus, ModuleType, Task, TaskStatus, TimeInterval,
    ROOT_USER,
};
use crate::patches::{parse_patch, JobPatch};
use crate::pipeline::{requires_evaluation, StageGraph};
use crate::query::{Filter, Identity, ListQuery, Page, SortSpec};
use crate::repositories::DocumentUpdate;
use crate::services::datasets::DatasetService;
use crate::services::repository::Repository;
use crate::services::tasks::bulk_task_transition;
use crate::services::{referenced, update_with_retry};
use crate::state_machine::{StateMachine, Transition};

pub const DEFAULT_MAX_TASKS: u64 = 100;

/// 作业结束或即将结束后不再接收新模型
const CLOSED_JOB_STATUSES: [JobStatus; 4] = [
    JobStatus::Terminating,
    JobStatus::Terminated,
    JobStatus::Error,
    JobStatus::Completed,
];

#[derive(Debug, Clone, Default, PartialEq)]
pub struct NewJob {
    pub dataset: String,
    pub models: Vec<String>,
    /// 针对部分模型的配置空间重定义，`[{"id": .., "config": ..}]`
    pub config_space: String,
    pub accept_new_models: bool,
    pub objective: String,
    pub alt_objectives: Vec<String>,
    pub pipeline: Vec<String>,
    /// 预训练任务，非空时跳过训练阶段
    pub task_ids: Vec<String>,
    pub max_tasks: Option<u64>,
}

#[derive(Clone)]
pub struct JobService {
    jobs: Repository<Job>,
    modules: Repository<Module>,
    tasks: Repository<Task>,
    datasets: DatasetService,
    graph: Arc<StageGraph>,
}

impl JobService {
    pub fn new(
        jobs: Repository<Job>,
        modules: Repository<Module>,
        tasks: Repository<Task>,
        datasets: DatasetService,
        graph: Arc<StageGraph>,
    ) -> Self {
        Self {
            jobs,
            modules,
            tasks,
            datasets,
            graph,
        }
    }

    /// 创建作业并立即进入运行状态
    pub async fn create(&self, identity: &Identity, new: NewJob) -> TrellisResult<Job> {
        let dataset = referenced(self.datasets.get(identity, &new.dataset).await, "数据集")?;
        if dataset.status != DatasetStatus::Validated {
            return Err(TrellisError::bad_input(format!(
                "数据集 {} 尚未通过验证，当前状态 {}",
                dataset.id, dataset.status
            )));
        }

        let pretrained = !new.task_ids.is_empty();
        let pipeline = self.graph.parse_pipeline(&new.pipeline, pretrained)?;

        if !pretrained && new.models.is_empty() {
            return Err(TrellisError::bad_input("需要训练的作业至少要有一个模型"));
        }
        let models = self
            .active_modules(identity, &new.models, ModuleType::Model)
            .await?;

        if requires_evaluation(&pipeline) {
            self.active_modules(identity, std::slice::from_ref(&new.objective), ModuleType::Objective)
                .await?;
            self.active_modules(identity, &new.alt_objectives, ModuleType::Objective)
                .await?;
        }

        for task_id in &new.task_ids {
            referenced(self.tasks.get(identity, task_id).await, "预训练任务")?;
        }

        let max_tasks = match new.max_tasks {
            None | Some(0) => DEFAULT_MAX_TASKS,
            Some(n) => n,
        };

        let id = uuid::Uuid::new_v4().simple().to_string();
        let redefinitions = parse_redefinitions(&new.config_space)?;
        let config_space = build_config_space(&id, &models, &redefinitions)?;

        let job = Job {
            id: id.clone(),
            user: identity.user_id().to_string(),
            dataset: dataset.id,
            models: new.models,
            config_space,
            accept_new_models: new.accept_new_models,
            objective: new.objective,
            alt_objectives: new.alt_objectives,
            pipeline,
            task_ids: new.task_ids,
            max_tasks,
            creation_time: Utc::now(),
            running_time: TimeInterval::default(),
            pause_start_time: None,
            prev_pause_duration: 0,
            status: JobStatus::Scheduled,
            status_message: String::new(),
            process: None,
        };
        self.jobs.insert(&job).await?;
        info!(job_id = %id, dataset = %job.dataset, models = job.models.len(), "创建作业");

        self.set_status(&Identity::root(), &id, JobStatus::Running, "")
            .await
    }

    pub async fn get(&self, identity: &Identity, id: &str) -> TrellisResult<Job> {
        self.jobs.get(identity, id).await
    }

    pub async fn list(&self, identity: &Identity, query: &ListQuery) -> TrellisResult<Page<Job>> {
        self.jobs.list(identity, query, vec![], None).await
    }

    /// 作业存储的配置空间
    pub async fn config_space(&self, identity: &Identity, id: &str) -> TrellisResult<String> {
        Ok(self.jobs.get(identity, id).await?.config_space)
    }

    /// 更新作业，只有作业所有者与 root 可以修改
    pub async fn update(&self, identity: &Identity, id: &str, patch: JobPatch) -> TrellisResult<Job> {
        let current = self.jobs.get(identity, id).await?;
        if !identity.is_root() && current.user != identity.user_id() {
            return Err(TrellisError::unauthorized(format!(
                "用户 {} 不能修改作业 {id}",
                identity.user_id()
            )));
        }
        if patch.max_tasks == Some(0) {
            return Err(TrellisError::bad_input("max-tasks 必须大于 0"));
        }

        let models = match &patch.models {
            Some(ids) => Some(self.active_modules(identity, ids, ModuleType::Model).await?),
            None => None,
        };

        let now = Utc::now();
        let (updated, _) = update_with_retry(&self.jobs, identity, id, |current| {
            let mut update = DocumentUpdate::new();
            if let (Some(ids), Some(models)) = (&patch.models, &models) {
                let redefinitions = parse_redefinitions(&current.config_space)?;
                update = update
                    .set("models", json!(ids))
                    .set(
                        "config-space",
                        build_config_space(&current.id, models, &redefinitions)?,
                    );
            }
            if let Some(accept) = patch.accept_new_models {
                update = update.set("accept-new-models", accept);
            }
            if let Some(max_tasks) = patch.max_tasks {
                update = update.set("max-tasks", max_tasks);
            }
            if let Some(message) = &patch.status_message {
                update = update.set("status-message", message.as_str());
            }
            if let Some(status) = patch.status {
                update = job_transition(update, current, status, now)?;
            }
            Ok(update)
        })
        .await?;

        if let Some(status) = patch.status {
            info!(job_id = id, status = %status, "更新作业状态");
        }
        Ok(updated)
    }

    pub async fn update_fields(
        &self,
        identity: &Identity,
        id: &str,
        fields: Map<String, Value>,
    ) -> TrellisResult<Job> {
        self.update(identity, id, parse_patch(fields)?).await
    }

    pub async fn set_status(
        &self,
        identity: &Identity,
        id: &str,
        status: JobStatus,
        message: &str,
    ) -> TrellisResult<Job> {
        self.update(identity, id, JobPatch::status(status, message)).await
    }

    /// 把新激活的模型挂到所有匹配的作业上，返回实际挂载的作业数
    ///
    /// 匹配条件：作业的数据集已验证且与模型的输入输出 schema 匹配，作业仍在进行中并接受新模型，
    /// 模型对作业所有者可见。每个作业按修订号条件写入，模型已存在时跳过。
    pub async fn attach_model_to_matching_jobs(&self, module: &Module) -> TrellisResult<u64> {
        let root = Identity::root();
        let datasets = self
            .datasets
            .find_validated_matching(&root, &module.schema_in, &module.schema_out)
            .await?;
        if datasets.is_empty() {
            debug!(module_id = %module.id, "没有与模型 schema 匹配的数据集");
            return Ok(0);
        }

        let jobs = self
            .jobs
            .find_all(
                &root,
                vec![
                    Filter::is_in("dataset", datasets.iter().map(|d| d.id.as_str())),
                    Filter::status_not_in(&CLOSED_JOB_STATUSES[..]),
                    Filter::eq("accept-new-models", true),
                ],
                SortSpec::default(),
            )
            .await?;

        let default_config = module_config(module)?;
        let mut attached = 0;
        for job in jobs {
            if module.user != job.user && module.user != ROOT_USER {
                continue;
            }

            let (_, written) = update_with_retry(&self.jobs, &root, &job.id, |current| {
                if current.models.contains(&module.id)
                    || !current.accept_new_models
                    || CLOSED_JOB_STATUSES.contains(&current.status)
                {
                    return Ok(DocumentUpdate::new());
                }
                let config_space =
                    extend_config_space(current, &module.id, default_config.clone())?;
                Ok(DocumentUpdate::new()
                    .append_unique("models", module.id.as_str())
                    .set("config-space", config_space))
            })
            .await?;

            if written {
                attached += 1;
                debug!(job_id = %job.id, module_id = %module.id, "作业加入新模型");
            }
        }
        Ok(attached)
    }

    /// 已完成任务数达到上限时结束作业，并终止其余任务
    pub async fn complete_if_quota_reached(&self, id: &str) -> TrellisResult<bool> {
        let root = Identity::root();
        let job = self.jobs.get(&root, id).await?;
        if job.status != JobStatus::Running {
            return Ok(false);
        }

        let completed = self
            .tasks
            .count(
                &root,
                vec![Filter::eq("job", id), Filter::status(TaskStatus::Completed)],
            )
            .await?;
        if completed < job.max_tasks {
            return Ok(false);
        }

        match self
            .set_status(&root, id, JobStatus::Completed, "已完成的任务数达到上限")
            .await
        {
            Ok(_) => {}
            // 作业刚被暂停或终止，交给对应的维护流程
            Err(e) if e.kind() == ErrorKind::BadInput => {
                debug!(job_id = id, error = %e, "作业状态已变化，放弃完成");
                return Ok(false);
            }
            Err(e) => return Err(e),
        }

        let terminated = bulk_task_transition(&self.tasks, id, TaskStatus::Terminating).await?;
        info!(job_id = id, completed, terminated, "作业已完成");
        Ok(true)
    }

    async fn active_modules(
        &self,
        identity: &Identity,
        ids: &[String],
        expected: ModuleType,
    ) -> TrellisResult<Vec<Module>> {
        let mut modules = Vec::with_capacity(ids.len());
        for id in ids {
            let module = referenced(self.modules.get(identity, id).await, "模块")?;
            if module.module_type != expected {
                return Err(TrellisError::bad_input(format!(
                    "模块 {id} 的类型是 {}，需要 {expected}",
                    module.module_type
                )));
            }
            if module.status != ModuleStatus::Active {
                return Err(TrellisError::bad_input(format!(
                    "模块 {id} 尚未激活，当前状态 {}",
                    module.status
                )));
            }
            modules.push(module);
        }
        Ok(modules)
    }
}

/// 在状态变更之外附带写入的时间字段
///
/// 进入 `running` 时记录开始时间，进入 `paused` 时记录暂停起点，离开 `paused` 时累计暂停时长，
/// 进入 `completed`、`terminated`、`error` 时记录结束时间。
fn job_transition(
    update: DocumentUpdate,
    current: &Job,
    status: JobStatus,
    now: DateTime<Utc>,
) -> TrellisResult<DocumentUpdate> {
    if current.status.validate_transition(status)? == Transition::Unchanged {
        return Ok(update);
    }

    let now_ms = now.timestamp_millis();
    let mut update = update.set("status", status.as_str());

    if current.status == JobStatus::Paused {
        let paused_for = current
            .pause_start_time
            .map_or(0, |start| (now - start).num_milliseconds());
        update = update
            .set("prev-pause-duration", current.prev_pause_duration + paused_for)
            .set("pause-start-time", Value::Null);
    }

    match status {
        JobStatus::Running => {
            if current.running_time.start.is_none() {
                update = update.set("running-time.start", now_ms);
            }
        }
        JobStatus::Paused => {
            update = update.set("pause-start-time", now_ms);
        }
        JobStatus::Completed | JobStatus::Terminated | JobStatus::Error => {
            update = update.set("running-time.end", now_ms);
        }
        JobStatus::Scheduled | JobStatus::Pausing | JobStatus::Resuming | JobStatus::Terminating => {}
    }

    if status.releases_lock() {
        update = update.set("process", Value::Null);
    }
    Ok(update)
}

fn module_config(module: &Module) -> TrellisResult<Value> {
    if module.config_space.is_empty() {
        return Ok(json!({}));
    }
    Ok(serde_json::from_str(&module.config_space)?)
}

/// 解析配置空间重定义
///
/// 接受 `[{"id": .., "config": ..}]` 列表，也接受作业自身存储的 `{"model": {".choice": [..]}}` 形式。
fn parse_redefinitions(text: &str) -> TrellisResult<BTreeMap<String, Value>> {
    if text.trim().is_empty() {
        return Ok(BTreeMap::new());
    }
    let value: Value = serde_json::from_str(text)
        .map_err(|e| TrellisError::bad_input(format!("配置空间不是合法的 JSON: {e}")))?;

    let entries = match &value {
        Value::Array(entries) => entries,
        Value::Object(_) => match value.pointer("/model/.choice") {
            Some(Value::Array(entries)) => entries,
            _ => return Err(TrellisError::bad_input("配置空间缺少 model 选项列表")),
        },
        _ => return Err(TrellisError::bad_input("配置空间必须是列表或对象")),
    };

    entries
        .iter()
        .map(|entry| {
            let id = entry
                .get("id")
                .and_then(Value::as_str)
                .ok_or_else(|| TrellisError::bad_input("配置空间条目缺少 id"))?;
            let config = entry.get("config").cloned().unwrap_or_else(|| json!({}));
            Ok((id.to_string(), config))
        })
        .collect()
}

/// 作业配置空间：在模型之间做选择，每个模型带自己的配置空间
fn build_config_space(
    job_id: &str,
    models: &[Module],
    redefinitions: &BTreeMap<String, Value>,
) -> TrellisResult<String> {
    let choices = models
        .iter()
        .map(|module| {
            let config = match redefinitions.get(&module.id) {
                Some(config) => config.clone(),
                None => module_config(module)?,
            };
            Ok(json!({"id": module.id, "config": config}))
        })
        .collect::<TrellisResult<Vec<_>>>()?;
    Ok(json!({"id": job_id, "model": {".choice": choices}}).to_string())
}

fn extend_config_space(job: &Job, model_id: &str, config: Value) -> TrellisResult<String> {
    let redefinitions = parse_redefinitions(&job.config_space)?;
    let mut choices: Vec<Value> = job
        .models
        .iter()
        .map(|id| {
            let config = redefinitions.get(id).cloned().unwrap_or_else(|| json!({}));
            json!({"id": id, "config": config})
        })
        .collect();
    choices.push(json!({"id": model_id, "config": config}));
    Ok(json!({"id": job.id, "model": {".choice": choices}}).to_string())
}
