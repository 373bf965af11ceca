//! 领域服务
//!
//! 每个服务封装一种资源的创建、查询与状态迁移规则，存储访问统一经过 [`Repository`]。
//! 状态写入采用读取、校验、按修订号条件写入的方式，修订号冲突时重新读取再校验。

use std::sync::Arc;

use serde_json::Value;
use tracing::debug;
use trellis_errors::{TrellisError, TrellisResult};

use crate::entities::{Dataset, Job, Module, Process, Task, User};
use crate::pipeline::StageGraph;
use crate::query::{Identity, ListQuery};
use crate::repositories::{DocumentUpdate, Resource, ResourceStore};
use crate::schema::SchemaOracle;

pub mod datasets;
pub mod jobs;
pub mod locks;
pub mod modules;
pub mod processes;
pub mod repository;
pub mod tasks;
pub mod user_cache;
pub mod users;

pub use datasets::{DatasetService, NewDataset};
pub use jobs::{JobService, NewJob, DEFAULT_MAX_TASKS};
pub use locks::{LockManager, ReleasedLocks};
pub use modules::{ModuleService, NewModule};
pub use processes::{ProcessHost, ProcessRegistry, ReclaimedProcess};
pub use repository::{Repository, Versioned};
pub use tasks::{NewTask, StageReport, TaskService};
pub use user_cache::UserCache;
pub use users::{Credentials, NewUser, UserService};

/// 全部领域服务，共享同一个存储
#[derive(Clone)]
pub struct ResourceEngine {
    pub users: UserService,
    pub datasets: DatasetService,
    pub modules: ModuleService,
    pub jobs: JobService,
    pub tasks: TaskService,
    pub processes: ProcessRegistry,
    pub locks: LockManager,
}

impl ResourceEngine {
    pub fn new(
        store: Arc<dyn ResourceStore>,
        oracle: Arc<dyn SchemaOracle>,
        user_cache: UserCache,
    ) -> TrellisResult<Self> {
        let graph = Arc::new(StageGraph::standard()?);

        let users = UserService::new(Repository::<User>::new(Arc::clone(&store)), user_cache);
        let datasets = DatasetService::new(
            Repository::<Dataset>::new(Arc::clone(&store)),
            Arc::clone(&oracle),
        );
        let jobs = JobService::new(
            Repository::<Job>::new(Arc::clone(&store)),
            Repository::<Module>::new(Arc::clone(&store)),
            Repository::<Task>::new(Arc::clone(&store)),
            datasets.clone(),
            Arc::clone(&graph),
        );
        let modules = ModuleService::new(
            Repository::<Module>::new(Arc::clone(&store)),
            Arc::clone(&oracle),
            jobs.clone(),
        );
        let tasks = TaskService::new(
            Repository::<Task>::new(Arc::clone(&store)),
            Repository::<Job>::new(Arc::clone(&store)),
        );
        let locks = LockManager::new(Arc::clone(&store));
        let processes = ProcessRegistry::new(Repository::<Process>::new(store), locks.clone());

        Ok(Self {
            users,
            datasets,
            modules,
            jobs,
            tasks,
            processes,
            locks,
        })
    }
}

// 修订号冲突通常意味着别人刚写入，重新读取后再试；冲突持续发生时交给上层的重试策略
const MAX_REVISION_CONFLICTS: u32 = 16;

/// 读取、生成更新、按修订号条件写入
///
/// `build` 返回空更新时不写入。返回写入后的资源以及是否真的写入。
pub(crate) async fn update_with_retry<T, F>(
    repository: &Repository<T>,
    identity: &Identity,
    id: &str,
    mut build: F,
) -> TrellisResult<(T, bool)>
where
    T: Resource,
    F: FnMut(&T) -> TrellisResult<DocumentUpdate>,
{
    for attempt in 0..MAX_REVISION_CONFLICTS {
        let current = repository.get_versioned(identity, id).await?;
        let update = build(&current.value)?;
        if update.is_empty() {
            return Ok((current.value, false));
        }

        match repository
            .update_by_id(identity, id, Some(current.revision), &update)
            .await?
        {
            Some(updated) => return Ok((updated.value, true)),
            None => {
                metrics::counter!(
                    "trellis_revision_conflicts_total",
                    "collection" => T::COLLECTION.name()
                )
                .increment(1);
                debug!(collection = %T::COLLECTION, id, attempt, "修订号冲突，重新读取");
            }
        }
    }

    Err(TrellisError::storage(format!(
        "{} {id} 连续 {MAX_REVISION_CONFLICTS} 次修订号冲突",
        T::COLLECTION
    )))
}

pub(crate) fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// 把调用方给出的标识规范成 `user/name`，返回完整标识与名称
///
/// 只给名称时补上调用者前缀；前缀不是调用者本人时拒绝。
pub(crate) fn qualified_id(identity: &Identity, id: &str) -> TrellisResult<(String, String)> {
    let name = match id.split_once('/') {
        None => id,
        Some((owner, name)) => {
            if owner != identity.user_id() {
                return Err(TrellisError::bad_input(format!(
                    "标识 {id} 的前缀必须是 {}",
                    identity.user_id()
                )));
            }
            name
        }
    };
    if !is_valid_name(name) {
        return Err(TrellisError::bad_input(format!(
            "名称 {name} 只能包含字母、数字、下划线和连字符"
        )));
    }
    Ok((format!("{}/{name}", identity.user_id()), name.to_string()))
}

/// 从列表查询中取出 schema 过滤条件
pub(crate) fn take_schema_filters(
    query: &ListQuery,
) -> TrellisResult<(ListQuery, Option<String>, Option<String>)> {
    let mut query = query.clone();
    let mut take = |name: &str| -> TrellisResult<Option<String>> {
        match query.filters.remove(name) {
            None => Ok(None),
            Some(Value::String(s)) => Ok(Some(s)),
            Some(other) => Err(TrellisError::bad_input(format!(
                "{name} 过滤值必须是字符串: {other}"
            ))),
        }
    };
    let schema_in = take("schema-in")?;
    let schema_out = take("schema-out")?;
    Ok((query, schema_in, schema_out))
}

/// 引用的资源不存在时按输入错误处理
pub(crate) fn referenced<T>(result: TrellisResult<T>, what: &str) -> TrellisResult<T> {
    result.map_err(|e| {
        if e.is_not_found() {
            TrellisError::bad_input(format!("引用的{what}不存在"))
        } else {
            e
        }
    })
}
