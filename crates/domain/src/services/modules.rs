use std::sync::Arc;

use chrono::Utc;
use serde_json::{Map, Value};
use tracing::info;
use trellis_errors::TrellisResult;

use crate::entities::{Module, ModuleSource, ModuleStatus, ModuleType};
use crate::patches::{parse_patch, ModulePatch};
use crate::query::{Identity, ListQuery, Page};
use crate::repositories::DocumentUpdate;
use crate::schema::{compact_json, SchemaOracle};
use crate::services::jobs::JobService;
use crate::services::repository::Repository;
use crate::services::{qualified_id, take_schema_filters, update_with_retry};
use crate::state_machine::{StateMachine, Transition};

#[derive(Debug, Clone, PartialEq)]
pub struct NewModule {
    /// `user/name` 或只给名称
    pub id: String,
    pub description: String,
    pub module_type: ModuleType,
    pub label: String,
    pub schema_in: String,
    pub schema_out: String,
    pub config_space: String,
    pub source: ModuleSource,
    pub source_address: String,
}

#[derive(Clone)]
pub struct ModuleService {
    modules: Repository<Module>,
    oracle: Arc<dyn SchemaOracle>,
    jobs: JobService,
}

impl ModuleService {
    pub fn new(modules: Repository<Module>, oracle: Arc<dyn SchemaOracle>, jobs: JobService) -> Self {
        Self {
            modules,
            oracle,
            jobs,
        }
    }

    pub async fn create(&self, identity: &Identity, new: NewModule) -> TrellisResult<Module> {
        let (id, name) = qualified_id(identity, &new.id)?;
        let config_space = if new.config_space.is_empty() {
            String::new()
        } else {
            compact_json(&new.config_space)?
        };

        let module = Module {
            id,
            user: identity.user_id().to_string(),
            name,
            description: new.description,
            module_type: new.module_type,
            label: new.label,
            schema_in: self.oracle.normalize(&new.schema_in)?,
            schema_out: self.oracle.normalize(&new.schema_out)?,
            config_space,
            source: new.source,
            source_address: new.source_address,
            creation_time: Utc::now(),
            status: ModuleStatus::Created,
            status_message: String::new(),
            process: None,
        };

        let created = self.modules.insert(&module).await?.value;
        info!(module_id = %created.id, module_type = %created.module_type, "创建模块");
        Ok(created)
    }

    pub async fn get(&self, identity: &Identity, id: &str) -> TrellisResult<Module> {
        self.modules.get(identity, id).await
    }

    pub async fn list(&self, identity: &Identity, query: &ListQuery) -> TrellisResult<Page<Module>> {
        let (query, schema_in, schema_out) = take_schema_filters(query)?;
        if schema_in.is_none() && schema_out.is_none() {
            return self.modules.list(identity, &query, vec![], None).await;
        }

        let oracle = Arc::clone(&self.oracle);
        let keep = move |module: &Module| {
            schema_in
                .as_deref()
                .map_or(true, |s| oracle.matches(&module.schema_in, s))
                && schema_out
                    .as_deref()
                    .map_or(true, |s| oracle.matches(&module.schema_out, s))
        };
        self.modules.list(identity, &query, vec![], Some(&keep)).await
    }

    /// 更新模块
    ///
    /// 模型进入 `active` 后挂到所有匹配且接受新模型的作业上。挂载是幂等的，
    /// 状态已经是 `active` 时再次请求 `active` 会重新执行挂载，用于补齐上次中断的部分。
    pub async fn update(&self, identity: &Identity, id: &str, patch: ModulePatch) -> TrellisResult<Module> {
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
        let config_space = patch
            .config_space
            .as_deref()
            .filter(|s| !s.is_empty())
            .map(compact_json)
            .transpose()?;

        let (updated, _) = update_with_retry(&self.modules, identity, id, |current| {
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
            if let Some(config_space) = &config_space {
                update = update.set("config-space", config_space.as_str());
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
            info!(module_id = id, status = %status, "更新模块状态");
        }

        if patch.status == Some(ModuleStatus::Active)
            && updated.status == ModuleStatus::Active
            && updated.module_type == ModuleType::Model
        {
            let attached = self.jobs.attach_model_to_matching_jobs(&updated).await?;
            if attached > 0 {
                info!(module_id = id, jobs = attached, "新模型已加入匹配的作业");
            }
        }

        Ok(updated)
    }

    pub async fn update_fields(
        &self,
        identity: &Identity,
        id: &str,
        fields: Map<String, Value>,
    ) -> TrellisResult<Module> {
        self.update(identity, id, parse_patch(fields)?).await
    }

    pub async fn set_status(
        &self,
        identity: &Identity,
        id: &str,
        status: ModuleStatus,
        message: &str,
    ) -> TrellisResult<Module> {
        self.update(identity, id, ModulePatch::status(status, message))
            .await
    }
}
