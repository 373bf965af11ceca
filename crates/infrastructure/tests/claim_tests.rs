mod common;

use std::collections::HashSet;
use std::time::Duration;

use futures::future::join_all;
use trellis_core::config::DatabaseConfig;
use trellis_domain::query::{FieldKind, SortOrder};
use trellis_domain::{
    ErrorKind, Filter, Identity, ModuleType, NewTask, SortSpec, Task, TaskStatus, TrellisResult,
};

use common::{active_module, context_with, memory_context, training_job, validated_dataset, TestContext};

async fn seed_tasks(ctx: &TestContext, count: usize) -> String {
    let alice = Identity::user("alice");
    let dataset = validated_dataset(ctx, &alice, "iris").await;
    let model = active_module(ctx, &alice, "forest", ModuleType::Model).await;
    let job = training_job(ctx, &alice, &dataset, &[&model], None).await;
    for _ in 0..count {
        ctx.engine
            .tasks
            .create(
                &alice,
                NewTask {
                    job: job.id.clone(),
                    model: model.id.clone(),
                    config: r#"{"lr": 0.01}"#.to_string(),
                    quality_expected: None,
                },
            )
            .await
            .unwrap();
    }
    job.id
}

/// 反复认领直到没有可认领的任务；存储瞬时故障时稍后重试
async fn drain(ctx: &TestContext, owner: String) -> TrellisResult<Vec<String>> {
    let mut claimed = Vec::new();
    loop {
        match ctx
            .engine
            .locks
            .claim::<Task>(
                &Identity::root(),
                vec![Filter::status(TaskStatus::Scheduled)],
                &SortSpec::by("creation-time", FieldKind::Timestamp, SortOrder::Asc),
                &owner,
            )
            .await
        {
            Ok(task) => {
                assert_eq!(task.process.as_deref(), Some(owner.as_str()));
                claimed.push(task.id);
            }
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(claimed),
            Err(e) if e.is_retryable() => tokio::time::sleep(Duration::from_millis(5)).await,
            Err(e) => return Err(e),
        }
    }
}

async fn assert_each_task_claimed_once(ctx: &TestContext, claimers: usize, tasks: usize) {
    let results = join_all((0..claimers).map(|i| drain(ctx, format!("worker-{i}")))).await;

    let mut all = Vec::new();
    for result in results {
        all.extend(result.unwrap());
    }
    assert_eq!(all.len(), tasks);
    assert_eq!(all.iter().collect::<HashSet<_>>().len(), tasks);
}

#[tokio::test]
async fn test_task_ids_are_sequential_per_job() {
    let ctx = memory_context().await;
    let job_id = seed_tasks(&ctx, 3).await;
    let page = ctx
        .engine
        .tasks
        .list(
            &Identity::root(),
            &trellis_domain::ListQuery::new().filter("job", job_id.as_str()),
        )
        .await
        .unwrap();
    let ids: Vec<_> = page.items.iter().map(|t| t.id.clone()).collect();
    assert_eq!(
        ids,
        vec![
            format!("{job_id}/0000000001"),
            format!("{job_id}/0000000002"),
            format!("{job_id}/0000000003"),
        ]
    );
    assert!(page.items.iter().all(|t| t.user == "alice" && t.stage.as_str() == "begin"));
}

#[tokio::test]
async fn test_concurrent_claims_in_memory() {
    let ctx = memory_context().await;
    seed_tasks(&ctx, 20).await;
    assert_each_task_claimed_once(&ctx, 8, 20).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_claims_on_file_database() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = context_with(DatabaseConfig {
        url: format!("sqlite://{}", dir.path().join("claims.db").display()),
        max_connections: 8,
        ..Default::default()
    })
    .await;
    seed_tasks(&ctx, 30).await;
    assert_each_task_claimed_once(&ctx, 6, 30).await;
}

#[tokio::test]
async fn test_release_semantics() {
    let ctx = memory_context().await;
    let job_id = seed_tasks(&ctx, 1).await;
    let task_id = format!("{job_id}/0000000001");
    let root = Identity::root();
    let locks = &ctx.engine.locks;

    locks
        .claim::<Task>(&root, vec![Filter::eq("id", task_id.as_str())], &SortSpec::default(), "p1")
        .await
        .unwrap();

    // 已上锁的资源不能被再次认领
    let err = locks
        .claim::<Task>(&root, vec![Filter::eq("id", task_id.as_str())], &SortSpec::default(), "p2")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    let err = locks.release::<Task>(&root, &task_id, "p2").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    let err = locks
        .release::<Task>(&Identity::user("alice"), &task_id, "p1")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    locks.release::<Task>(&root, &task_id, "p1").await.unwrap();
    locks.release::<Task>(&root, &task_id, "p1").await.unwrap();

    let task = ctx.engine.tasks.get(&root, &task_id).await.unwrap();
    assert!(task.process.is_none());
}
