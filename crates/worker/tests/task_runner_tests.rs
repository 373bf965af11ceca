use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use trellis_core::config::DatabaseConfig;
use trellis_core::RetryConfig;
use trellis_domain::{
    Dataset, DatasetSource, DatasetStatus, ExactSchemaOracle, Filter, Identity, Job, JobStatus,
    Module, ModuleSource, ModuleStatus, ModuleType, NewDataset, NewJob, NewModule, NewTask,
    Process, ProcessHost, ProcessStatus, ProcessType, ResourceEngine, ResourceStore, SortSpec,
    Stage, StageReport, Task, TaskStatus, UserCache,
};
use trellis_errors::{TrellisError, TrellisResult};
use trellis_infrastructure::DatabaseManager;
use trellis_worker::{
    CommandStageExecutor, KeepaliveManager, StageExecutor, TaskRunner, TaskStatusMaintainer,
    WorkerContext,
};

const SCHEMA_IN: &str = r#"{"columns":["x","y"]}"#;
const SCHEMA_OUT: &str = r#"{"columns":["label"]}"#;

struct Harness {
    _db: DatabaseManager,
    engine: ResourceEngine,
    worker: Process,
    ctx: WorkerContext,
}

async fn harness() -> Harness {
    let db = DatabaseManager::new(&DatabaseConfig {
        url: "sqlite::memory:".to_string(),
        ..Default::default()
    })
    .await
    .unwrap();
    db.migrate().await.unwrap();
    let store: Arc<dyn ResourceStore> = Arc::new(db.resource_store());
    let engine =
        ResourceEngine::new(store, Arc::new(ExactSchemaOracle), UserCache::default()).unwrap();

    let host = ProcessHost {
        process_id: 7,
        host_id: "worker-host".to_string(),
        host_address: "127.0.0.1".to_string(),
    };
    let worker = engine
        .processes
        .register(&host, ProcessType::Worker, "")
        .await
        .unwrap();
    let ctx = WorkerContext::new(
        engine.clone(),
        worker.id.clone(),
        Duration::from_millis(10),
        RetryConfig {
            default_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
            backoff_multiplier: 2.0,
        },
    );
    Harness {
        _db: db,
        engine,
        worker,
        ctx,
    }
}

async fn validated_dataset(h: &Harness, owner: &Identity) -> Dataset {
    let dataset = h
        .engine
        .datasets
        .create(
            owner,
            NewDataset {
                id: "iris".to_string(),
                description: String::new(),
                schema_in: SCHEMA_IN.to_string(),
                schema_out: SCHEMA_OUT.to_string(),
                source: DatasetSource::Upload,
                source_address: String::new(),
            },
        )
        .await
        .unwrap();
    for status in [DatasetStatus::Transferred, DatasetStatus::Unpacked, DatasetStatus::Validated] {
        h.engine
            .datasets
            .set_status(&Identity::root(), &dataset.id, status, "")
            .await
            .unwrap();
    }
    dataset
}

async fn active_model(h: &Harness, owner: &Identity) -> Module {
    let module = h
        .engine
        .modules
        .create(
            owner,
            NewModule {
                id: "forest".to_string(),
                description: String::new(),
                module_type: ModuleType::Model,
                label: String::new(),
                schema_in: SCHEMA_IN.to_string(),
                schema_out: SCHEMA_OUT.to_string(),
                config_space: String::new(),
                source: ModuleSource::Upload,
                source_address: String::new(),
            },
        )
        .await
        .unwrap();
    for status in [ModuleStatus::Transferred, ModuleStatus::Active] {
        h.engine
            .modules
            .set_status(&Identity::root(), &module.id, status, "")
            .await
            .unwrap();
    }
    module
}

/// 建一个两阶段作业并在其下创建 `count` 个任务
async fn seed(h: &Harness, max_tasks: u64, count: usize) -> (Job, Vec<Task>) {
    let alice = Identity::user("alice");
    let dataset = validated_dataset(h, &alice).await;
    let model = active_model(h, &alice).await;
    let job = h
        .engine
        .jobs
        .create(
            &alice,
            NewJob {
                dataset: dataset.id,
                models: vec![model.id.clone()],
                pipeline: vec!["train".to_string(), "predict".to_string()],
                max_tasks: Some(max_tasks),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let mut tasks = Vec::new();
    for _ in 0..count {
        tasks.push(
            h.engine
                .tasks
                .create(
                    &alice,
                    NewTask {
                        job: job.id.clone(),
                        model: model.id.clone(),
                        config: r#"{"depth": 3}"#.to_string(),
                        quality_expected: None,
                    },
                )
                .await
                .unwrap(),
        );
    }
    (job, tasks)
}

#[derive(Default)]
struct ScriptedExecutor {
    calls: Mutex<Vec<Stage>>,
    fail_on: Option<Stage>,
    /// 执行到该阶段时把任务置为暂停中，模拟用户在阶段执行期间暂停
    pause_during: Option<(Stage, ResourceEngine)>,
}

impl ScriptedExecutor {
    fn calls(&self) -> Vec<Stage> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl StageExecutor for ScriptedExecutor {
    async fn execute(&self, task: &Task, stage: Stage) -> TrellisResult<StageReport> {
        self.calls.lock().unwrap().push(stage);
        if self.fail_on == Some(stage) {
            return Err(TrellisError::internal(format!("{stage} 崩溃")));
        }
        if let Some((pause_stage, engine)) = &self.pause_during {
            if *pause_stage == stage {
                engine
                    .tasks
                    .set_status(&Identity::root(), &task.id, TaskStatus::Pausing, "")
                    .await?;
            }
        }
        Ok(StageReport {
            quality: Some(if stage == Stage::Train { 0.6 } else { 0.8 }),
            ..Default::default()
        })
    }
}

#[tokio::test]
async fn test_task_runs_every_stage_and_completes_job() {
    let h = harness().await;
    let (job, tasks) = seed(&h, 1, 1).await;
    let executor = Arc::new(ScriptedExecutor::default());
    let runner = TaskRunner::new(h.ctx.clone(), executor.clone());

    assert!(runner.process_next().await.unwrap());
    assert!(!runner.process_next().await.unwrap());
    assert_eq!(executor.calls(), vec![Stage::Train, Stage::Predict]);

    let root = Identity::root();
    let task = h.engine.tasks.get(&root, &tasks[0].id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.stage, Stage::End);
    assert_eq!(task.quality, Some(0.8));
    assert!(task.process.is_none());
    assert!(task.stage_duration(Stage::Train).is_some());
    assert!(task.stage_duration(Stage::Predict).is_some());

    let job = h.engine.jobs.get(&root, &job.id).await.unwrap();
    assert_eq!(job.status, JobStatus::Completed);

    let worker = h.engine.processes.get(&root, &h.worker.id).await.unwrap();
    assert_eq!(worker.status, ProcessStatus::Idle);
}

#[tokio::test]
async fn test_failed_stage_marks_error_and_keeps_lock() {
    let h = harness().await;
    let (job, tasks) = seed(&h, 10, 1).await;
    let executor = Arc::new(ScriptedExecutor {
        fail_on: Some(Stage::Predict),
        ..Default::default()
    });
    let runner = TaskRunner::new(h.ctx.clone(), executor);

    assert!(runner.process_next().await.unwrap());

    let root = Identity::root();
    let task = h.engine.tasks.get(&root, &tasks[0].id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Error);
    assert_eq!(task.stage, Stage::Predict);
    assert!(task.status_message.contains("predict"));
    assert_eq!(task.process.as_deref(), Some(h.worker.id.as_str()));
    // 出错时补记当前阶段的结束时间
    assert!(task.stage_duration(Stage::Predict).is_some());
    assert_eq!(h.engine.jobs.get(&root, &job.id).await.unwrap().status, JobStatus::Running);
}

#[tokio::test]
async fn test_pause_takes_effect_between_stages() {
    let h = harness().await;
    let (_, tasks) = seed(&h, 10, 1).await;
    let executor = Arc::new(ScriptedExecutor {
        pause_during: Some((Stage::Train, h.engine.clone())),
        ..Default::default()
    });
    let runner = TaskRunner::new(h.ctx.clone(), executor.clone());
    let root = Identity::root();

    assert!(runner.process_next().await.unwrap());
    let task = h.engine.tasks.get(&root, &tasks[0].id).await.unwrap();
    // 训练阶段照常跑完，之后停在预测阶段之前
    assert_eq!(task.status, TaskStatus::Paused);
    assert_eq!(task.stage, Stage::Predict);
    assert_eq!(task.quality, Some(0.6));
    assert!(task.process.is_none());
    assert_eq!(executor.calls(), vec![Stage::Train]);

    h.engine
        .tasks
        .set_status(&root, &task.id, TaskStatus::Scheduled, "")
        .await
        .unwrap();
    assert!(runner.process_next().await.unwrap());
    let task = h.engine.tasks.get(&root, &tasks[0].id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(executor.calls(), vec![Stage::Train, Stage::Predict]);
}

#[tokio::test]
async fn test_orphaned_running_task_is_resumed() {
    let h = harness().await;
    let (_, tasks) = seed(&h, 10, 1).await;
    let root = Identity::root();
    let id = tasks[0].id.as_str();

    h.engine
        .locks
        .claim::<Task>(&root, vec![Filter::eq("id", id)], &SortSpec::default(), "dead-worker")
        .await
        .unwrap();
    h.engine.tasks.set_status(&root, id, TaskStatus::Running, "").await.unwrap();
    h.engine.tasks.advance_stage(&root, id).await.unwrap();
    h.engine.locks.release::<Task>(&root, id, "dead-worker").await.unwrap();

    let executor = Arc::new(ScriptedExecutor::default());
    let runner = TaskRunner::new(h.ctx.clone(), executor.clone());
    assert!(runner.process_next().await.unwrap());

    assert_eq!(executor.calls(), vec![Stage::Train, Stage::Predict]);
    let task = h.engine.tasks.get(&root, id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
}

#[tokio::test]
async fn test_maintainer_settles_unowned_tasks() {
    let h = harness().await;
    let (_, tasks) = seed(&h, 10, 2).await;
    let root = Identity::root();
    let maintainer = TaskStatusMaintainer::new(h.ctx.clone());

    assert!(!maintainer.process_next().await.unwrap());

    h.engine
        .tasks
        .set_status(&root, &tasks[0].id, TaskStatus::Pausing, "")
        .await
        .unwrap();
    h.engine
        .tasks
        .set_status(&root, &tasks[1].id, TaskStatus::Terminating, "")
        .await
        .unwrap();

    assert!(maintainer.process_next().await.unwrap());
    assert!(maintainer.process_next().await.unwrap());
    assert!(!maintainer.process_next().await.unwrap());

    let paused = h.engine.tasks.get(&root, &tasks[0].id).await.unwrap();
    assert_eq!(paused.status, TaskStatus::Paused);
    assert!(paused.process.is_none());
    let terminated = h.engine.tasks.get(&root, &tasks[1].id).await.unwrap();
    assert_eq!(terminated.status, TaskStatus::Terminated);
    assert!(terminated.process.is_none());
}

#[tokio::test]
async fn test_keepalive_stops_when_process_declared_dead() {
    let h = harness().await;
    h.engine.processes.terminate(&h.worker.id).await.unwrap();

    let (_tx, rx) = tokio::sync::broadcast::channel(1);
    let keepalive = KeepaliveManager::new(
        h.engine.processes.clone(),
        h.worker.id.clone(),
        Duration::from_millis(5),
    );
    let err = tokio::time::timeout(Duration::from_secs(1), keepalive.run(rx))
        .await
        .unwrap()
        .unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_keepalive_refreshes_until_shutdown() {
    let h = harness().await;
    let before = h.worker.last_keepalive;
    let (tx, rx) = tokio::sync::broadcast::channel(1);
    let keepalive = KeepaliveManager::new(
        h.engine.processes.clone(),
        h.worker.id.clone(),
        Duration::from_millis(5),
    );

    let handle = tokio::spawn(async move { keepalive.run(rx).await });
    tokio::time::sleep(Duration::from_millis(30)).await;
    tx.send(()).unwrap();
    handle.await.unwrap().unwrap();

    let worker = h.engine.processes.get(&Identity::root(), &h.worker.id).await.unwrap();
    assert!(worker.last_keepalive > before);
}

#[cfg(unix)]
mod command_executor {
    use super::*;

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".to_string(), "-c".to_string(), script.to_string()]
    }

    #[tokio::test]
    async fn test_reports_quality_from_last_line() {
        let h = harness().await;
        let (_, tasks) = seed(&h, 10, 1).await;
        let executor = CommandStageExecutor::new(
            &sh(r#"echo "training $TRELLIS_TASK_ID"; [ "$TRELLIS_STAGE" = train ] && echo '{"quality": 0.5, "quality-train": 0.7}'"#),
            None,
        )
        .unwrap();

        let report = executor.execute(&tasks[0], Stage::Train).await.unwrap();
        assert_eq!(report.quality, Some(0.5));
        assert_eq!(report.quality_train, Some(0.7));
    }

    #[tokio::test]
    async fn test_non_zero_exit_is_failure() {
        let h = harness().await;
        let (_, tasks) = seed(&h, 10, 1).await;
        let executor = CommandStageExecutor::new(&sh("echo boom >&2; exit 3"), None).unwrap();

        let err = executor.execute(&tasks[0], Stage::Train).await.unwrap_err();
        assert!(err.to_string().contains("boom"));
    }

    #[tokio::test]
    async fn test_stage_timeout() {
        let h = harness().await;
        let (_, tasks) = seed(&h, 10, 1).await;
        let executor =
            CommandStageExecutor::new(&sh("sleep 5"), Some(Duration::from_millis(100))).unwrap();

        let err = tokio::time::timeout(
            Duration::from_secs(3),
            executor.execute(&tasks[0], Stage::Predict),
        )
        .await
        .unwrap()
        .unwrap_err();
        assert!(err.to_string().contains("predict"));
    }
}
