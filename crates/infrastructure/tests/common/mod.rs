#![allow(dead_code)]

use std::sync::Arc;

use trellis_core::config::DatabaseConfig;
use trellis_domain::{
    Dataset, DatasetSource, DatasetStatus, ExactSchemaOracle, Identity, Job, Module, ModuleSource,
    ModuleStatus, ModuleType, NewDataset, NewJob, NewModule, ResourceEngine, ResourceStore,
    UserCache,
};
use trellis_infrastructure::DatabaseManager;

pub const SCHEMA_IN: &str = r#"{"columns":["x","y"]}"#;
pub const SCHEMA_OUT: &str = r#"{"columns":["label"]}"#;

pub struct TestContext {
    pub db: DatabaseManager,
    pub store: Arc<dyn ResourceStore>,
    pub engine: ResourceEngine,
}

pub async fn memory_context() -> TestContext {
    context_with(DatabaseConfig {
        url: "sqlite::memory:".to_string(),
        ..Default::default()
    })
    .await
}

pub async fn context_with(config: DatabaseConfig) -> TestContext {
    let db = DatabaseManager::new(&config).await.unwrap();
    db.migrate().await.unwrap();
    let store: Arc<dyn ResourceStore> = Arc::new(db.resource_store());
    let engine = ResourceEngine::new(
        Arc::clone(&store),
        Arc::new(ExactSchemaOracle),
        UserCache::default(),
    )
    .unwrap();
    TestContext { db, store, engine }
}

pub async fn validated_dataset(ctx: &TestContext, owner: &Identity, name: &str) -> Dataset {
    let dataset = ctx
        .engine
        .datasets
        .create(
            owner,
            NewDataset {
                id: name.to_string(),
                description: String::new(),
                schema_in: SCHEMA_IN.to_string(),
                schema_out: SCHEMA_OUT.to_string(),
                source: DatasetSource::Local,
                source_address: format!("/data/{name}"),
            },
        )
        .await
        .unwrap();

    let root = Identity::root();
    for status in [
        DatasetStatus::Transferred,
        DatasetStatus::Unpacked,
        DatasetStatus::Validated,
    ] {
        ctx.engine
            .datasets
            .set_status(&root, &dataset.id, status, "")
            .await
            .unwrap();
    }
    ctx.engine.datasets.get(&root, &dataset.id).await.unwrap()
}

pub async fn active_module(
    ctx: &TestContext,
    owner: &Identity,
    name: &str,
    module_type: ModuleType,
) -> Module {
    let module = ctx
        .engine
        .modules
        .create(
            owner,
            NewModule {
                id: name.to_string(),
                description: String::new(),
                module_type,
                label: String::new(),
                schema_in: SCHEMA_IN.to_string(),
                schema_out: SCHEMA_OUT.to_string(),
                config_space: r#"{"lr": {".float": [0.001, 0.1]}}"#.to_string(),
                source: ModuleSource::Local,
                source_address: format!("/modules/{name}"),
            },
        )
        .await
        .unwrap();

    let root = Identity::root();
    for status in [ModuleStatus::Transferred, ModuleStatus::Active] {
        ctx.engine
            .modules
            .set_status(&root, &module.id, status, "")
            .await
            .unwrap();
    }
    ctx.engine.modules.get(&root, &module.id).await.unwrap()
}

/// 只含训练阶段的作业，不需要目标函数
pub async fn training_job(
    ctx: &TestContext,
    owner: &Identity,
    dataset: &Dataset,
    models: &[&Module],
    max_tasks: Option<u64>,
) -> Job {
    ctx.engine
        .jobs
        .create(
            owner,
            NewJob {
                dataset: dataset.id.clone(),
                models: models.iter().map(|m| m.id.clone()).collect(),
                accept_new_models: true,
                pipeline: vec!["train".to_string()],
                max_tasks,
                ..Default::default()
            },
        )
        .await
        .unwrap()
}
