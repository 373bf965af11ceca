use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use trellis_core::AppConfig;
use trellis_dispatcher::{
    ControllerContext, DatasetProcessor, DatasetStep, DeadProcessReaper, DeadProcessReaperConfig,
    JobStatusMaintainer, LocalSourcePreparer, ModuleProcessor, ModuleStep,
};
use trellis_domain::{
    ExactSchemaOracle, ProcessHost, ProcessType, ResourceEngine, ResourceStore, UserCache,
};
use trellis_infrastructure::DatabaseManager;
use trellis_worker::{
    CommandStageExecutor, KeepaliveManager, TaskRunner, TaskStatusMaintainer, WorkerContext,
};

use crate::shutdown::ShutdownManager;

/// 应用运行模式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppMode {
    /// 仅运行控制进程
    Controller,
    /// 仅运行工作进程
    Worker,
    /// 同一进程内同时运行两者
    All,
}

impl AppMode {
    fn runs_controller(self) -> bool {
        matches!(self, AppMode::Controller | AppMode::All)
    }

    fn runs_worker(self) -> bool {
        matches!(self, AppMode::Worker | AppMode::All)
    }
}

/// 主应用程序
pub struct Application {
    config: AppConfig,
    mode: AppMode,
    db: DatabaseManager,
    engine: ResourceEngine,
}

impl Application {
    /// 连接存储、建表并确保 root 用户存在
    pub async fn new(config: AppConfig, mode: AppMode) -> Result<Self> {
        info!("初始化应用程序，模式: {:?}", mode);

        let db = DatabaseManager::new(&config.database).await?;
        db.migrate().await?;

        let store: Arc<dyn ResourceStore> = Arc::new(db.resource_store());
        let user_cache = UserCache::new(
            config.cache.user_capacity,
            Duration::from_secs(config.cache.user_ttl_seconds),
        );
        let engine = ResourceEngine::new(store, Arc::new(ExactSchemaOracle), user_cache)
            .context("初始化领域服务失败")?;
        engine
            .users
            .bootstrap_root()
            .await
            .context("初始化root用户失败")?;

        Ok(Self {
            config,
            mode,
            db,
            engine,
        })
    }

    /// 运行到收到关闭信号为止，退出前注销本应用注册的进程
    pub async fn run(&self, shutdown: ShutdownManager) -> Result<()> {
        let mut handles = Vec::new();
        let mut process_ids = Vec::new();

        if self.mode.runs_controller() {
            process_ids.push(self.start_controller(&shutdown, &mut handles).await?);
        }
        if self.mode.runs_worker() {
            process_ids.push(self.start_worker(&shutdown, &mut handles).await?);
        }

        info!("已启动 {} 个循环", handles.len());
        for result in futures::future::join_all(handles).await {
            if let Err(e) = result {
                error!("循环异常退出: {e}");
            }
        }

        for id in process_ids {
            match self.engine.processes.terminate(&id).await {
                Ok(released) => info!(process_id = %id, released = released.total(), "进程已注销"),
                Err(e) => warn!(process_id = %id, error = %e, "注销进程失败"),
            }
        }
        Ok(())
    }

    pub async fn close(&self) {
        self.db.close().await;
    }

    async fn start_controller(
        &self,
        shutdown: &ShutdownManager,
        handles: &mut Vec<JoinHandle<()>>,
    ) -> Result<String> {
        let process = self
            .engine
            .processes
            .register(&ProcessHost::detect(), ProcessType::Controller, "")
            .await
            .context("注册控制进程失败")?;
        info!(process_id = %process.id, "控制进程已注册");

        let ctx = ControllerContext::new(
            self.engine.clone(),
            process.id.clone(),
            self.config.polling.listener_period(),
            self.config.polling.retry_config(),
        );
        let settings = &self.config.controller;
        handles.push(self.spawn_keepalive(&process.id, shutdown).await);

        if settings.reaper_enabled {
            let reaper = DeadProcessReaper::new(
                self.engine.processes.clone(),
                Some(DeadProcessReaperConfig {
                    detection_interval: self.config.process.keepalive_interval(),
                    dead_cutoff: self.config.process.dead_process_cutoff(),
                }),
            );
            let rx = shutdown.subscribe().await;
            handles.push(tokio::spawn(async move { reaper.run(rx).await }));
        }

        if settings.job_maintenance_enabled {
            let maintainer = JobStatusMaintainer::new(ctx.clone());
            let rx = shutdown.subscribe().await;
            handles.push(tokio::spawn(async move { maintainer.run(rx).await }));
        }

        let preparer = Arc::new(LocalSourcePreparer::new());
        if settings.dataset_processing_enabled {
            for step in DatasetStep::ALL {
                let processor = DatasetProcessor::new(ctx.clone(), preparer.clone(), step);
                let rx = shutdown.subscribe().await;
                handles.push(tokio::spawn(async move { processor.run(rx).await }));
            }
        }
        if settings.module_processing_enabled {
            for step in ModuleStep::ALL {
                let processor = ModuleProcessor::new(ctx.clone(), preparer.clone(), step);
                let rx = shutdown.subscribe().await;
                handles.push(tokio::spawn(async move { processor.run(rx).await }));
            }
        }

        Ok(process.id)
    }

    async fn start_worker(
        &self,
        shutdown: &ShutdownManager,
        handles: &mut Vec<JoinHandle<()>>,
    ) -> Result<String> {
        let process = self
            .engine
            .processes
            .register(&ProcessHost::detect(), ProcessType::Worker, "")
            .await
            .context("注册工作进程失败")?;
        info!(process_id = %process.id, "工作进程已注册");

        let ctx = WorkerContext::new(
            self.engine.clone(),
            process.id.clone(),
            self.config.polling.listener_period(),
            self.config.polling.retry_config(),
        );
        let settings = &self.config.worker;
        handles.push(self.spawn_keepalive(&process.id, shutdown).await);

        if settings.task_maintenance_enabled {
            let maintainer = TaskStatusMaintainer::new(ctx.clone());
            let rx = shutdown.subscribe().await;
            handles.push(tokio::spawn(async move { maintainer.run(rx).await }));
        }

        if settings.stage_command.is_empty() {
            warn!("未配置 worker.stage_command，不启动任务执行循环");
        } else {
            let executor =
                CommandStageExecutor::new(&settings.stage_command, settings.stage_timeout())?;
            let runner = TaskRunner::new(ctx, Arc::new(executor));
            let rx = shutdown.subscribe().await;
            handles.push(tokio::spawn(async move { runner.run(rx).await }));
        }

        Ok(process.id)
    }

    /// 保活失败说明本进程已被回收，触发整个应用关闭
    async fn spawn_keepalive(&self, process_id: &str, shutdown: &ShutdownManager) -> JoinHandle<()> {
        let keepalive = KeepaliveManager::new(
            self.engine.processes.clone(),
            process_id,
            self.config.process.keepalive_interval(),
        );
        let rx = shutdown.subscribe().await;
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = keepalive.run(rx).await {
                error!(error = %e, "保活终止，关闭应用");
                shutdown.shutdown().await;
            }
        })
    }
}
