//! 文档存储抽象
//!
//! 每个集合是一张以行号为主键的 JSON 文档表。所有条件写入都是单条语句：
//! 匹配与修改在存储内部原子完成，认领、字段更新与按修订号的比较交换都走这一条路径。

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use trellis_errors::TrellisResult;

use crate::collection::Collection;
use crate::entities::{Dataset, Job, Module, Process, Task, User};
use crate::query::{Filter, FindSpec, SortSpec};

/// 存储返回的一条文档
#[derive(Debug, Clone, PartialEq)]
pub struct StoredDocument {
    pub oid: i64,
    pub revision: i64,
    pub body: Value,
}

impl StoredDocument {
    pub fn decode<T: DeserializeOwned>(&self) -> TrellisResult<T> {
        Ok(serde_json::from_value(self.body.clone())?)
    }

    /// 按 `.` 分隔的路径读取字段
    pub fn field(&self, path: &str) -> Option<&Value> {
        path.split('.')
            .try_fold(&self.body, |value, segment| value.get(segment))
    }
}

/// 单次写入要修改的字段
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DocumentUpdate {
    pub set: Vec<(String, Value)>,
    /// 追加到数组字段，元素已存在时跳过
    pub append_unique: Vec<(String, Value)>,
}

impl DocumentUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, path: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set.push((path.into(), value.into()));
        self
    }

    pub fn append_unique(mut self, path: impl Into<String>, value: impl Into<Value>) -> Self {
        self.append_unique.push((path.into(), value.into()));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty() && self.append_unique.is_empty()
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// 插入新文档，`id` 重复时返回 `IdentifierTaken`
    async fn insert(&self, collection: Collection, body: Value) -> TrellisResult<StoredDocument>;

    async fn count(&self, collection: Collection, filters: &[Filter]) -> TrellisResult<u64>;

    async fn find(&self, collection: Collection, spec: &FindSpec) -> TrellisResult<Vec<StoredDocument>>;

    /// 按排序取第一条满足条件的文档并修改，返回修改后的文档；没有匹配时返回 `None`
    async fn update_first(
        &self,
        collection: Collection,
        filters: &[Filter],
        sort: &SortSpec,
        update: &DocumentUpdate,
    ) -> TrellisResult<Option<StoredDocument>>;

    /// 修改全部满足条件的文档，返回修改条数
    async fn update_all(
        &self,
        collection: Collection,
        filters: &[Filter],
        update: &DocumentUpdate,
    ) -> TrellisResult<u64>;
}

/// 可存入某个集合的资源
pub trait Resource: Serialize + DeserializeOwned + Send + Sync + 'static {
    const COLLECTION: Collection;

    fn id(&self) -> &str;

    /// 持有该资源锁的进程
    fn lock_holder(&self) -> Option<&str> {
        None
    }
}

macro_rules! resource {
    ($ty:ty, $collection:expr) => {
        impl Resource for $ty {
            const COLLECTION: Collection = $collection;

            fn id(&self) -> &str {
                &self.id
            }
        }
    };
    ($ty:ty, $collection:expr, lockable) => {
        impl Resource for $ty {
            const COLLECTION: Collection = $collection;

            fn id(&self) -> &str {
                &self.id
            }

            fn lock_holder(&self) -> Option<&str> {
                self.process.as_deref()
            }
        }
    };
}

resource!(User, Collection::Users);
resource!(Dataset, Collection::Datasets, lockable);
resource!(Module, Collection::Modules, lockable);
resource!(Job, Collection::Jobs, lockable);
resource!(Task, Collection::Tasks, lockable);
resource!(Process, Collection::Processes);

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_field_reads_nested_paths() {
        let doc = StoredDocument {
            oid: 1,
            revision: 0,
            body: json!({"running-time": {"start": 5, "end": null}}),
        };
        assert_eq!(doc.field("running-time.start"), Some(&json!(5)));
        assert_eq!(doc.field("running-time.end"), Some(&Value::Null));
        assert_eq!(doc.field("missing.path"), None);
    }
}
