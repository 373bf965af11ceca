use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{error, info};

use trellis_core::run_polling_loop;
use trellis_domain::query::{FieldKind, SortOrder};
use trellis_domain::{
    Dataset, DatasetPatch, DatasetSource, DatasetStatus, Filter, Identity, ProcessStatus, SortSpec,
};
use trellis_errors::TrellisResult;

use crate::context::ControllerContext;
use crate::preparers::DatasetPreparer;

/// 数据集准备流程中的一步，每一步各自一个轮询循环
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatasetStep {
    /// created → transferred，上传的数据集由上传流程负责
    Transfer,
    /// transferred → unpacked
    Unpack,
    /// unpacked → validated，同时写入 schema
    Validate,
}

impl DatasetStep {
    pub const ALL: [DatasetStep; 3] = [DatasetStep::Transfer, DatasetStep::Unpack, DatasetStep::Validate];

    pub fn name(&self) -> &'static str {
        match self {
            DatasetStep::Transfer => "dataset-transfer",
            DatasetStep::Unpack => "dataset-unpack",
            DatasetStep::Validate => "dataset-validate",
        }
    }

    fn claim_filters(&self) -> Vec<Filter> {
        match self {
            DatasetStep::Transfer => vec![
                Filter::status(DatasetStatus::Created),
                Filter::ne("source", DatasetSource::Upload.as_str()),
            ],
            DatasetStep::Unpack => vec![Filter::status(DatasetStatus::Transferred)],
            DatasetStep::Validate => vec![Filter::status(DatasetStatus::Unpacked)],
        }
    }
}

pub struct DatasetProcessor {
    ctx: ControllerContext,
    preparer: Arc<dyn DatasetPreparer>,
    step: DatasetStep,
}

impl DatasetProcessor {
    pub fn new(ctx: ControllerContext, preparer: Arc<dyn DatasetPreparer>, step: DatasetStep) -> Self {
        Self { ctx, preparer, step }
    }

    /// 认领一个处于本步骤起点的数据集并推进一步
    pub async fn process_next(&self) -> TrellisResult<bool> {
        let root = Identity::root();
        let dataset = match self
            .ctx
            .engine
            .locks
            .claim::<Dataset>(
                &root,
                self.step.claim_filters(),
                &SortSpec::by("creation-time", FieldKind::Timestamp, SortOrder::Asc),
                &self.ctx.process_id,
            )
            .await
        {
            Ok(dataset) => dataset,
            Err(e) if e.is_not_found() => return Ok(false),
            Err(e) => return Err(e),
        };

        self.ctx.mark_process(ProcessStatus::Working).await;
        let result = self.advance(&dataset).await;
        self.ctx.mark_process(ProcessStatus::Idle).await;
        result.map(|_| true)
    }

    async fn advance(&self, dataset: &Dataset) -> TrellisResult<()> {
        let root = Identity::root();
        let datasets = &self.ctx.engine.datasets;
        let id = dataset.id.as_str();

        let patch = match self.step {
            DatasetStep::Transfer => self
                .preparer
                .transfer(dataset)
                .await
                .map(|_| DatasetPatch::status(DatasetStatus::Transferred, "")),
            DatasetStep::Unpack => self
                .preparer
                .unpack(dataset)
                .await
                .map(|_| DatasetPatch::status(DatasetStatus::Unpacked, "")),
            DatasetStep::Validate => self.preparer.validate(dataset).await.map(|schemas| DatasetPatch {
                schema_in: Some(schemas.schema_in),
                schema_out: Some(schemas.schema_out),
                ..DatasetPatch::status(DatasetStatus::Validated, "")
            }),
        };

        let patch = match patch {
            Ok(patch) => patch,
            Err(e) => {
                // 出错的数据集保持上锁，留给人工排查
                error!(dataset_id = id, step = self.step.name(), error = %e, "数据集准备失败");
                metrics::counter!("trellis_preparation_failures_total", "step" => self.step.name())
                    .increment(1);
                let message = e.to_string();
                self.ctx
                    .bookkeep("mark-dataset-error", || {
                        datasets.set_status(&root, id, DatasetStatus::Error, &message)
                    })
                    .await?;
                return Ok(());
            }
        };

        let updated = self
            .ctx
            .bookkeep("update-dataset", || datasets.update(&root, id, patch.clone()))
            .await?;
        info!(dataset_id = id, step = self.step.name(), status = %updated.status, "数据集准备推进一步");

        let owner = self.ctx.process_id.as_str();
        let locks = &self.ctx.engine.locks;
        self.ctx
            .bookkeep("release-dataset", || locks.release::<Dataset>(&root, id, owner))
            .await?;
        metrics::counter!("trellis_releases_total", "collection" => "datasets").increment(1);
        Ok(())
    }

    pub async fn run(&self, shutdown_rx: broadcast::Receiver<()>) {
        run_polling_loop(self.step.name(), self.ctx.poll_period, shutdown_rx, || {
            self.process_next()
        })
        .await;
    }
}
