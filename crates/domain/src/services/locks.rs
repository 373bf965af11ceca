use std::sync::Arc;

use tracing::{debug, info};
use trellis_errors::{TrellisError, TrellisResult};

use crate::collection::Collection;
use crate::query::{Filter, Identity, SortSpec};
use crate::repositories::{DocumentUpdate, Resource, ResourceStore};
use crate::services::repository::Repository;

/// 某个进程被回收的锁数量
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReleasedLocks {
    pub datasets: u64,
    pub modules: u64,
    pub jobs: u64,
    pub tasks: u64,
}

impl ReleasedLocks {
    pub fn total(&self) -> u64 {
        self.datasets + self.modules + self.jobs + self.tasks
    }
}

/// 基于 `process` 字段的资源锁
///
/// 认领是一次条件写入：`process` 为空是匹配条件的一部分，并发认领同一资源时至多一个成功。
#[derive(Clone)]
pub struct LockManager {
    store: Arc<dyn ResourceStore>,
}

impl LockManager {
    pub fn new(store: Arc<dyn ResourceStore>) -> Self {
        Self { store }
    }

    /// 认领排序后第一条满足条件且未上锁的资源，没有时返回 `NotFound`
    pub async fn claim<T: Resource>(
        &self,
        identity: &Identity,
        mut filters: Vec<Filter>,
        sort: &SortSpec,
        owner: &str,
    ) -> TrellisResult<T> {
        filters.push(Filter::is_null("process"));
        let update = DocumentUpdate::new().set("process", owner);
        let claimed = Repository::<T>::new(Arc::clone(&self.store))
            .update_first(identity, filters, sort, &update)
            .await?;

        match claimed {
            Some(versioned) => {
                metrics::counter!(
                    "trellis_claims_total",
                    "collection" => T::COLLECTION.name()
                )
                .increment(1);
                debug!(
                    collection = %T::COLLECTION,
                    id = versioned.value.id(),
                    owner,
                    "认领资源"
                );
                Ok(versioned.value)
            }
            None => Err(TrellisError::not_found(format!(
                "没有可认领的 {}",
                T::COLLECTION
            ))),
        }
    }

    /// 释放由 `owner` 持有的锁
    ///
    /// 锁已经被释放时视为成功；资源不存在或被其他进程持有时返回 `NotFound`。
    pub async fn release<T: Resource>(
        &self,
        identity: &Identity,
        id: &str,
        owner: &str,
    ) -> TrellisResult<()> {
        if !identity.is_root() {
            return Err(TrellisError::not_found(format!("{} {id}", T::COLLECTION)));
        }

        let repository = Repository::<T>::new(Arc::clone(&self.store));
        let update = DocumentUpdate::new().set("process", serde_json::Value::Null);
        let released = repository
            .update_first(
                identity,
                vec![Filter::eq("id", id), Filter::eq("process", owner)],
                &SortSpec::default(),
                &update,
            )
            .await?;
        if released.is_some() {
            debug!(collection = %T::COLLECTION, id, owner, "释放资源锁");
            return Ok(());
        }

        match repository.find_versioned(identity, id).await? {
            Some(current) => match current.value.lock_holder() {
                None => {
                    debug!(collection = %T::COLLECTION, id, "资源锁已释放，跳过");
                    Ok(())
                }
                Some(holder) => Err(TrellisError::not_found(format!(
                    "{} {id} 由 {holder} 持有而非 {owner}",
                    T::COLLECTION
                ))),
            },
            None => Err(TrellisError::not_found(format!("{} {id}", T::COLLECTION))),
        }
    }

    /// 释放某个进程持有的全部锁，处于出错状态的资源保持上锁
    pub async fn release_all_held_by(&self, owner: &str) -> TrellisResult<ReleasedLocks> {
        let filters = [Filter::eq("process", owner), Filter::ne("status", "error")];
        let update = DocumentUpdate::new().set("process", serde_json::Value::Null);

        let mut released = ReleasedLocks::default();
        for collection in Collection::LOCKABLE {
            let count = self.store.update_all(collection, &filters, &update).await?;
            match collection {
                Collection::Datasets => released.datasets = count,
                Collection::Modules => released.modules = count,
                Collection::Jobs => released.jobs = count,
                Collection::Tasks => released.tasks = count,
                Collection::Users | Collection::Processes => {}
            }
        }

        if released.total() > 0 {
            info!(
                owner,
                datasets = released.datasets,
                modules = released.modules,
                jobs = released.jobs,
                tasks = released.tasks,
                "回收进程持有的锁"
            );
        }
        Ok(released)
    }
}
