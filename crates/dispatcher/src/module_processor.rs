use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{error, info};

use trellis_core::run_polling_loop;
use trellis_domain::query::{FieldKind, SortOrder};
use trellis_domain::{
    Filter, Identity, Module, ModulePatch, ModuleSource, ModuleStatus, ProcessStatus, SortSpec,
};
use trellis_errors::TrellisResult;

use crate::context::ControllerContext;
use crate::preparers::ModulePreparer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleStep {
    /// created → transferred，上传的模块由上传流程负责
    Transfer,
    /// transferred → active，模型激活时会挂到匹配的作业上
    Activate,
}

impl ModuleStep {
    pub const ALL: [ModuleStep; 2] = [ModuleStep::Transfer, ModuleStep::Activate];

    pub fn name(&self) -> &'static str {
        match self {
            ModuleStep::Transfer => "module-transfer",
            ModuleStep::Activate => "module-activate",
        }
    }

    fn claim_filters(&self) -> Vec<Filter> {
        match self {
            ModuleStep::Transfer => vec![
                Filter::status(ModuleStatus::Created),
                Filter::ne("source", ModuleSource::Upload.as_str()),
            ],
            ModuleStep::Activate => vec![Filter::status(ModuleStatus::Transferred)],
        }
    }
}

pub struct ModuleProcessor {
    ctx: ControllerContext,
    preparer: Arc<dyn ModulePreparer>,
    step: ModuleStep,
}

impl ModuleProcessor {
    pub fn new(ctx: ControllerContext, preparer: Arc<dyn ModulePreparer>, step: ModuleStep) -> Self {
        Self { ctx, preparer, step }
    }

    pub async fn process_next(&self) -> TrellisResult<bool> {
        let root = Identity::root();
        let module = match self
            .ctx
            .engine
            .locks
            .claim::<Module>(
                &root,
                self.step.claim_filters(),
                &SortSpec::by("creation-time", FieldKind::Timestamp, SortOrder::Asc),
                &self.ctx.process_id,
            )
            .await
        {
            Ok(module) => module,
            Err(e) if e.is_not_found() => return Ok(false),
            Err(e) => return Err(e),
        };

        self.ctx.mark_process(ProcessStatus::Working).await;
        let result = self.advance(&module).await;
        self.ctx.mark_process(ProcessStatus::Idle).await;
        result.map(|_| true)
    }

    async fn advance(&self, module: &Module) -> TrellisResult<()> {
        let root = Identity::root();
        let modules = &self.ctx.engine.modules;
        let id = module.id.as_str();

        let patch = match self.step {
            ModuleStep::Transfer => self
                .preparer
                .transfer(module)
                .await
                .map(|_| ModulePatch::status(ModuleStatus::Transferred, "")),
            ModuleStep::Activate => self.preparer.validate(module).await.map(|description| ModulePatch {
                schema_in: Some(description.schema_in),
                schema_out: Some(description.schema_out),
                config_space: Some(description.config_space),
                ..ModulePatch::status(ModuleStatus::Active, "")
            }),
        };

        let patch = match patch {
            Ok(patch) => patch,
            Err(e) => {
                error!(module_id = id, step = self.step.name(), error = %e, "模块准备失败");
                metrics::counter!("trellis_preparation_failures_total", "step" => self.step.name())
                    .increment(1);
                let message = e.to_string();
                self.ctx
                    .bookkeep("mark-module-error", || {
                        modules.set_status(&root, id, ModuleStatus::Error, &message)
                    })
                    .await?;
                return Ok(());
            }
        };

        // 激活时的作业挂载是幂等的，重试不会重复挂载
        let updated = self
            .ctx
            .bookkeep("update-module", || modules.update(&root, id, patch.clone()))
            .await?;
        info!(module_id = id, step = self.step.name(), status = %updated.status, "模块准备推进一步");

        let owner = self.ctx.process_id.as_str();
        let locks = &self.ctx.engine.locks;
        self.ctx
            .bookkeep("release-module", || locks.release::<Module>(&root, id, owner))
            .await?;
        metrics::counter!("trellis_releases_total", "collection" => "modules").increment(1);
        Ok(())
    }

    pub async fn run(&self, shutdown_rx: broadcast::Receiver<()>) {
        run_polling_loop(self.step.name(), self.ctx.poll_period, shutdown_rx, || {
            self.process_next()
        })
        .await;
    }
}
