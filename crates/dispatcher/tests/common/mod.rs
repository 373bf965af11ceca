#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use trellis_core::config::DatabaseConfig;
use trellis_core::RetryConfig;
use trellis_dispatcher::ControllerContext;
use trellis_domain::{
    Dataset, DatasetSource, ExactSchemaOracle, Identity, Module, ModuleSource, ModuleType,
    NewDataset, NewModule, Process, ProcessHost, ProcessType, ResourceEngine, ResourceStore,
    UserCache,
};
use trellis_infrastructure::DatabaseManager;

pub const SCHEMA_IN: &str = r#"{"columns":["x","y"]}"#;
pub const SCHEMA_OUT: &str = r#"{"columns":["label"]}"#;

pub struct Harness {
    pub db: DatabaseManager,
    pub engine: ResourceEngine,
    pub controller: Process,
    pub ctx: ControllerContext,
}

pub fn test_host() -> ProcessHost {
    ProcessHost {
        process_id: 4242,
        host_id: "test-host".to_string(),
        host_address: "127.0.0.1".to_string(),
    }
}

pub async fn harness() -> Harness {
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
    let controller = engine
        .processes
        .register(&test_host(), ProcessType::Controller, "")
        .await
        .unwrap();
    let ctx = ControllerContext::new(
        engine.clone(),
        controller.id.clone(),
        Duration::from_millis(10),
        RetryConfig {
            default_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
            backoff_multiplier: 2.0,
        },
    );
    Harness {
        db,
        engine,
        controller,
        ctx,
    }
}

pub async fn local_dataset(h: &Harness, owner: &Identity, name: &str, address: &str) -> Dataset {
    h.engine
        .datasets
        .create(
            owner,
            NewDataset {
                id: name.to_string(),
                description: String::new(),
                schema_in: String::new(),
                schema_out: String::new(),
                source: DatasetSource::Local,
                source_address: address.to_string(),
            },
        )
        .await
        .unwrap()
}

pub async fn local_module(
    h: &Harness,
    owner: &Identity,
    name: &str,
    module_type: ModuleType,
    address: &str,
) -> Module {
    h.engine
        .modules
        .create(
            owner,
            NewModule {
                id: name.to_string(),
                description: String::new(),
                module_type,
                label: String::new(),
                schema_in: String::new(),
                schema_out: String::new(),
                config_space: String::new(),
                source: ModuleSource::Local,
                source_address: address.to_string(),
            },
        )
        .await
        .unwrap()
}

/// 在临时目录中写好数据集描述文件
pub fn dataset_dir() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("schema.json"),
        format!(r#"{{"schema-in": {SCHEMA_IN:?}, "schema-out": {SCHEMA_OUT:?}}}"#),
    )
    .unwrap();
    dir
}

pub fn module_dir() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("module.json"),
        format!(
            r#"{{"schema-in": {SCHEMA_IN:?}, "schema-out": {SCHEMA_OUT:?}, "config-space": "{{\"depth\": {{\".int\": [1, 8]}}}}"}}"#
        ),
    )
    .unwrap();
    dir
}
