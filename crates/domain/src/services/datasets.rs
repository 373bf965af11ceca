use std::sync::Arc;

use chrono::Utc;
use serde_json::{Map, Value};
use tracing::info;
use trellis_errors::TrellisResult;

use crate::entities::{Dataset, DatasetSource, DatasetStatus};
use crate::patches::{parse_patch, DatasetPatch};
use crate::query::{Filter, Identity, ListQuery, Page, SortSpec};
use crate::repositories::DocumentUpdate;
use crate::schema::SchemaOracle;
use crate::services::repository::Repository;
use crate::services::{qualified_id, update_with_retry, take_schema_filters};
use crate::state_machine::{StateMachine, Transition};

#[derive(Debug, Clone, PartialEq)]
pub struct NewDataset {
    /// `user/name` 或只给名称
    pub id: String,
    pub description: String,
    pub schema_in: String,
    pub schema_out: String,
    pub source: DatasetSource,
    pub source_address: String,
}

#[derive(Clone)]
pub struct DatasetService {
    datasets: Repository<Dataset>,
    oracle: Arc<dyn SchemaOracle>,
}

impl DatasetService {
    pub fn new(datasets: Repository<Dataset>, oracle: Arc<dyn SchemaOracle>) -> Self {
        Self { datasets, oracle }
    }

    pub async fn create(&self, identity: &Identity, new: NewDataset) -> TrellisResult<Dataset> {
        let (id, name) = qualified_id(identity, &new.id)?;
        let dataset = Dataset {
            id,
            user: identity.user_id().to_string(),
            name,
            description: new.description,
            schema_in: self.oracle.normalize(&new.schema_in)?,
            schema_out: self.oracle.normalize(&new.schema_out)?,
            source: new.source,
            source_address: new.source_address,
            creation_time: Utc::now(),
            status: DatasetStatus::Created,
            status_message: String::new(),
            process: None,
        };

        let created = self.datasets.insert(&dataset).await?.value;
        info!(dataset_id = %created.id, source = %created.source, "创建数据集");
        Ok(created)
    }

    pub async fn get(&self, identity: &Identity, id: &str) -> TrellisResult<Dataset> {
        self.datasets.get(identity, id).await
    }

    /// 列表查询，`schema-in` 与 `schema-out` 过滤交给 schema 判定做二次筛选
    pub async fn list(&self, identity: &Identity, query: &ListQuery) -> TrellisResult<Page<Dataset>> {
        let (query, schema_in, schema_out) = take_schema_filters(query)?;
        if schema_in.is_none() && schema_out.is_none() {
            return self.datasets.list(identity, &query, vec![], None).await;
        }

        let oracle = Arc::clone(&self.oracle);
        let keep = move |dataset: &Dataset| {
            schema_in
                .as_deref()
                .map_or(true, |s| oracle.matches(&dataset.schema_in, s))
                && schema_out
                    .as_deref()
                    .map_or(true, |s| oracle.matches(&dataset.schema_out, s))
        };
        self.datasets.list(identity, &query, vec![], Some(&keep)).await
    }

    /// 与给定输入输出 schema 匹配的已验证数据集
    pub async fn find_validated_matching(
        &self,
        identity: &Identity,
        schema_in: &str,
        schema_out: &str,
    ) -> TrellisResult<Vec<Dataset>> {
        let candidates = self
            .datasets
            .find_all(
                identity,
                vec![Filter::status(DatasetStatus::Validated)],
                SortSpec::default(),
            )
            .await?;
        Ok(candidates
            .into_iter()
            .filter(|d| {
                self.oracle.matches(&d.schema_in, schema_in)
                    && self.oracle.matches(&d.schema_out, schema_out)
            })
            .collect())
    }

    pub async fn update(&self, identity: &Identity, id: &str, patch: DatasetPatch) -> TrellisResult<Dataset> {
        let schema_in = patch
            .schema_in
            .as_deref()
            .map(|s| self.oracle.normalize(s))
            .transpose()?;
        let schema_out = patch
            .schema_out
            .as_deref()
            .map(|s| self.oracle.normalize(s))
            .transpose()?;

        let (updated, _) = update_with_retry(&self.datasets, identity, id, |current| {
            let mut update = DocumentUpdate::new();
            if let Some(name) = &patch.name {
                update = update.set("name", name.as_str());
            }
            if let Some(description) = &patch.description {
                update = update.set("description", description.as_str());
            }
            if let Some(schema) = &schema_in {
                update = update.set("schema-in", schema.as_str());
            }
            if let Some(schema) = &schema_out {
                update = update.set("schema-out", schema.as_str());
            }
            if let Some(message) = &patch.status_message {
                update = update.set("status-message", message.as_str());
            }
            if let Some(status) = patch.status {
                if current.status.validate_transition(status)? == Transition::Changed {
                    update = update.set("status", status.as_str());
                    if status.releases_lock() {
                        update = update.set("process", Value::Null);
                    }
                }
            }
            Ok(update)
        })
        .await?;

        if let Some(status) = patch.status {
            info!(dataset_id = id, status = %status, "更新数据集状态");
        }
        Ok(updated)
    }

    pub async fn update_fields(
        &self,
        identity: &Identity,
        id: &str,
        fields: Map<String, Value>,
    ) -> TrellisResult<Dataset> {
        self.update(identity, id, parse_patch(fields)?).await
    }

    pub async fn set_status(
        &self,
        identity: &Identity,
        id: &str,
        status: DatasetStatus,
        message: &str,
    ) -> TrellisResult<Dataset> {
        self.update(identity, id, DatasetPatch::status(status, message))
            .await
    }
}
