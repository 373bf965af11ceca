mod common;

use std::sync::Arc;
use std::time::Duration;

use trellis_dispatcher::{
    DatasetProcessor, DatasetStep, DeadProcessReaper, DeadProcessReaperConfig,
    JobStatusMaintainer, LocalSourcePreparer, ModuleProcessor, ModuleStep,
};
use trellis_domain::{
    Dataset, DatasetStatus, Filter, Identity, JobStatus, ListQuery, ModuleStatus, ModuleType,
    NewJob, NewTask, ProcessStatus, ProcessType, SortSpec, TaskStatus,
};

use common::{dataset_dir, harness, local_dataset, local_module, module_dir, test_host, Harness};

async fn prepare_dataset(h: &Harness, processor_steps: &[DatasetStep], id: &str) {
    let preparer = Arc::new(LocalSourcePreparer::new());
    for step in processor_steps {
        let processor = DatasetProcessor::new(h.ctx.clone(), preparer.clone(), *step);
        assert!(processor.process_next().await.unwrap(), "{} 没有认领到数据集", step.name());
    }
    let dataset = h.engine.datasets.get(&Identity::root(), id).await.unwrap();
    assert!(dataset.process.is_none() || dataset.status == DatasetStatus::Error);
}

async fn activate_module(h: &Harness, id: &str) {
    let preparer = Arc::new(LocalSourcePreparer::new());
    for step in ModuleStep::ALL {
        let processor = ModuleProcessor::new(h.ctx.clone(), preparer.clone(), step);
        assert!(processor.process_next().await.unwrap());
    }
    let module = h.engine.modules.get(&Identity::root(), id).await.unwrap();
    assert_eq!(module.status, ModuleStatus::Active);
}

#[tokio::test]
async fn test_dataset_preparation_reaches_validated() {
    let h = harness().await;
    let alice = Identity::user("alice");
    let dir = dataset_dir();
    let dataset = local_dataset(&h, &alice, "iris", &dir.path().display().to_string()).await;

    prepare_dataset(&h, &DatasetStep::ALL, &dataset.id).await;

    let dataset = h.engine.datasets.get(&alice, &dataset.id).await.unwrap();
    assert_eq!(dataset.status, DatasetStatus::Validated);
    assert_eq!(dataset.schema_in, common::SCHEMA_IN);
    assert_eq!(dataset.schema_out, common::SCHEMA_OUT);
    assert!(dataset.process.is_none());

    // 每一步只认领自己起点状态的数据集
    let idle = DatasetProcessor::new(
        h.ctx.clone(),
        Arc::new(LocalSourcePreparer::new()),
        DatasetStep::Transfer,
    );
    assert!(!idle.process_next().await.unwrap());

    let controller = h.engine.processes.get(&Identity::root(), &h.controller.id).await.unwrap();
    assert_eq!(controller.status, ProcessStatus::Idle);
}

#[tokio::test]
async fn test_failed_preparation_keeps_lock() {
    let h = harness().await;
    let alice = Identity::user("alice");
    let dataset = local_dataset(&h, &alice, "missing", "/nonexistent/trellis/data").await;

    prepare_dataset(&h, &[DatasetStep::Transfer], &dataset.id).await;

    let dataset = h.engine.datasets.get(&alice, &dataset.id).await.unwrap();
    assert_eq!(dataset.status, DatasetStatus::Error);
    assert!(dataset.status_message.contains("/nonexistent/trellis/data"));
    assert_eq!(dataset.process.as_deref(), Some(h.controller.id.as_str()));
}

#[tokio::test]
async fn test_module_activation_attaches_to_running_job() {
    let h = harness().await;
    let alice = Identity::user("alice");

    let data = dataset_dir();
    let dataset = local_dataset(&h, &alice, "iris", &data.path().display().to_string()).await;
    prepare_dataset(&h, &DatasetStep::ALL, &dataset.id).await;

    let first_dir = module_dir();
    let first = local_module(&h, &alice, "forest", ModuleType::Model, &first_dir.path().display().to_string()).await;
    activate_module(&h, &first.id).await;

    let job = h
        .engine
        .jobs
        .create(
            &alice,
            NewJob {
                dataset: dataset.id.clone(),
                models: vec![first.id.clone()],
                accept_new_models: true,
                pipeline: vec!["train".to_string()],
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let second_dir = module_dir();
    let second = local_module(&h, &alice, "boost", ModuleType::Model, &second_dir.path().display().to_string()).await;
    activate_module(&h, &second.id).await;

    let module = h.engine.modules.get(&alice, &second.id).await.unwrap();
    assert!(module.config_space.contains("depth"));

    let job = h.engine.jobs.get(&alice, &job.id).await.unwrap();
    assert_eq!(job.models, vec![first.id, second.id]);
}

#[tokio::test]
async fn test_job_maintainer_settles_transitions() {
    let h = harness().await;
    let alice = Identity::user("alice");
    let root = Identity::root();

    let data = dataset_dir();
    let dataset = local_dataset(&h, &alice, "iris", &data.path().display().to_string()).await;
    prepare_dataset(&h, &DatasetStep::ALL, &dataset.id).await;
    let model_dir = module_dir();
    let model = local_module(&h, &alice, "forest", ModuleType::Model, &model_dir.path().display().to_string()).await;
    activate_module(&h, &model.id).await;

    let job = h
        .engine
        .jobs
        .create(
            &alice,
            NewJob {
                dataset: dataset.id.clone(),
                models: vec![model.id.clone()],
                pipeline: vec!["train".to_string()],
                ..Default::default()
            },
        )
        .await
        .unwrap();
    for _ in 0..2 {
        h.engine
            .tasks
            .create(
                &alice,
                NewTask {
                    job: job.id.clone(),
                    model: model.id.clone(),
                    config: String::new(),
                    quality_expected: None,
                },
            )
            .await
            .unwrap();
    }

    let maintainer = JobStatusMaintainer::new(h.ctx.clone());
    assert!(!maintainer.process_next().await.unwrap());

    let task_statuses = |status: TaskStatus| {
        let engine = h.engine.clone();
        let job_id = job.id.clone();
        async move {
            engine
                .tasks
                .list(
                    &Identity::root(),
                    &ListQuery::new()
                        .filter("job", job_id.as_str())
                        .filter("status", status.as_str()),
                )
                .await
                .unwrap()
                .total_result_size
        }
    };

    h.engine.jobs.set_status(&alice, &job.id, JobStatus::Pausing, "").await.unwrap();
    assert!(maintainer.process_next().await.unwrap());
    let paused = h.engine.jobs.get(&root, &job.id).await.unwrap();
    assert_eq!(paused.status, JobStatus::Paused);
    assert!(paused.process.is_none());
    assert_eq!(task_statuses(TaskStatus::Pausing).await, 2);

    h.engine.jobs.set_status(&alice, &job.id, JobStatus::Resuming, "").await.unwrap();
    assert!(maintainer.process_next().await.unwrap());
    assert_eq!(h.engine.jobs.get(&root, &job.id).await.unwrap().status, JobStatus::Running);
    assert_eq!(task_statuses(TaskStatus::Scheduled).await, 2);

    h.engine.jobs.set_status(&alice, &job.id, JobStatus::Terminating, "").await.unwrap();
    assert!(maintainer.process_next().await.unwrap());
    let terminated = h.engine.jobs.get(&root, &job.id).await.unwrap();
    assert_eq!(terminated.status, JobStatus::Terminated);
    assert!(terminated.process.is_none());
    assert_eq!(task_statuses(TaskStatus::Terminating).await, 2);
}

#[tokio::test]
async fn test_reaper_releases_locks_of_dead_process() {
    let h = harness().await;
    let root = Identity::root();
    let alice = Identity::user("alice");

    let worker = h
        .engine
        .processes
        .register(&test_host(), ProcessType::Worker, "")
        .await
        .unwrap();
    let healthy = local_dataset(&h, &alice, "healthy", "/data/healthy").await;
    let broken = local_dataset(&h, &alice, "broken", "/data/broken").await;
    for id in [&healthy.id, &broken.id] {
        h.engine
            .locks
            .claim::<Dataset>(&root, vec![Filter::eq("id", id.as_str())], &SortSpec::default(), &worker.id)
            .await
            .unwrap();
    }
    h.engine
        .datasets
        .set_status(&root, &broken.id, DatasetStatus::Error, "校验失败")
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(20)).await;
    // 控制进程刚刚保活过，不应被回收
    h.engine.processes.keepalive(&h.controller.id).await.unwrap();

    let reaper = DeadProcessReaper::new(
        h.engine.processes.clone(),
        Some(DeadProcessReaperConfig {
            detection_interval: Duration::from_millis(10),
            dead_cutoff: Duration::from_millis(10),
        }),
    );
    let reclaimed = reaper.reap_once().await.unwrap();
    assert_eq!(reclaimed.len(), 1);
    assert_eq!(reclaimed[0].process.id, worker.id);
    assert_eq!(reclaimed[0].released.datasets, 1);

    let worker = h.engine.processes.get(&root, &worker.id).await.unwrap();
    assert_eq!(worker.status, ProcessStatus::Terminated);
    assert!(h.engine.datasets.get(&root, &healthy.id).await.unwrap().process.is_none());
    assert_eq!(
        h.engine.datasets.get(&root, &broken.id).await.unwrap().process.as_deref(),
        Some(worker.id.as_str())
    );

    // 已终止的进程不能再保活
    let err = h.engine.processes.keepalive(&worker.id).await.unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_reaper_loop_stops_on_shutdown() {
    let h = harness().await;
    let reaper = Arc::new(DeadProcessReaper::new(
        h.engine.processes.clone(),
        Some(DeadProcessReaperConfig {
            detection_interval: Duration::from_millis(5),
            dead_cutoff: Duration::from_secs(60),
        }),
    ));
    let (tx, rx) = tokio::sync::broadcast::channel(1);

    let running = Arc::clone(&reaper);
    let handle = tokio::spawn(async move { running.run(rx).await });
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(reaper.is_running().await);

    tx.send(()).unwrap();
    tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .unwrap()
        .unwrap();
    assert!(!reaper.is_running().await);
}
