use std::marker::PhantomData;
use std::sync::Arc;

use serde_json::Value;
use tracing::debug;
use trellis_errors::{TrellisError, TrellisResult};

use crate::collection::Collection;
use crate::cursor::{decode_cursor, encode_cursor};
use crate::query::{FindSpec, Filter, Identity, ListQuery, Page, SortSpec, REVISION_FIELD};
use crate::repositories::{DocumentUpdate, Resource, ResourceStore, StoredDocument};

pub const DEFAULT_PAGE_SIZE: u64 = 100;
pub const MAX_PAGE_SIZE: u64 = 1000;

/// 带修订号的资源快照
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned<T> {
    pub value: T,
    pub oid: i64,
    pub revision: i64,
}

impl<T: Resource> Versioned<T> {
    fn from_document(doc: StoredDocument) -> TrellisResult<Self> {
        Ok(Self {
            value: doc.decode()?,
            oid: doc.oid,
            revision: doc.revision,
        })
    }
}

/// 按资源类型包装的存储访问，统一附加身份可见范围
pub struct Repository<T> {
    store: Arc<dyn ResourceStore>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for Repository<T> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            _marker: PhantomData,
        }
    }
}

impl<T: Resource> Repository<T> {
    pub fn new(store: Arc<dyn ResourceStore>) -> Self {
        Self {
            store,
            _marker: PhantomData,
        }
    }

    pub fn collection(&self) -> Collection {
        T::COLLECTION
    }

    fn scoped(&self, identity: &Identity, mut filters: Vec<Filter>) -> Vec<Filter> {
        if let Some(scope) = identity.scope_filter(T::COLLECTION) {
            filters.push(scope);
        }
        filters
    }

    pub async fn insert(&self, value: &T) -> TrellisResult<Versioned<T>> {
        let body = serde_json::to_value(value)?;
        let doc = self.store.insert(T::COLLECTION, body).await?;
        debug!(collection = %T::COLLECTION, id = value.id(), oid = doc.oid, "插入文档");
        Versioned::from_document(doc)
    }

    pub async fn find_versioned(
        &self,
        identity: &Identity,
        id: &str,
    ) -> TrellisResult<Option<Versioned<T>>> {
        let spec = FindSpec {
            filters: self.scoped(identity, vec![Filter::eq("id", id)]),
            limit: Some(1),
            ..Default::default()
        };
        let docs = self.store.find(T::COLLECTION, &spec).await?;
        docs.into_iter().next().map(Versioned::from_document).transpose()
    }

    pub async fn get_versioned(&self, identity: &Identity, id: &str) -> TrellisResult<Versioned<T>> {
        self.find_versioned(identity, id).await?.ok_or_else(|| {
            TrellisError::not_found(format!("{} {id}", T::COLLECTION))
        })
    }

    pub async fn get(&self, identity: &Identity, id: &str) -> TrellisResult<T> {
        Ok(self.get_versioned(identity, id).await?.value)
    }

    pub async fn count(&self, identity: &Identity, filters: Vec<Filter>) -> TrellisResult<u64> {
        self.store
            .count(T::COLLECTION, &self.scoped(identity, filters))
            .await
    }

    pub async fn find_all(
        &self,
        identity: &Identity,
        filters: Vec<Filter>,
        sort: SortSpec,
    ) -> TrellisResult<Vec<T>> {
        let spec = FindSpec {
            filters: self.scoped(identity, filters),
            sort,
            ..Default::default()
        };
        self.store
            .find(T::COLLECTION, &spec)
            .await?
            .iter()
            .map(StoredDocument::decode)
            .collect()
    }

    /// 按排序修改第一条匹配的文档
    pub async fn update_first(
        &self,
        identity: &Identity,
        filters: Vec<Filter>,
        sort: &SortSpec,
        update: &DocumentUpdate,
    ) -> TrellisResult<Option<Versioned<T>>> {
        let filters = self.scoped(identity, filters);
        self.store
            .update_first(T::COLLECTION, &filters, sort, update)
            .await?
            .map(Versioned::from_document)
            .transpose()
    }

    /// 按标识修改；给出修订号时只在修订号未变的情况下写入
    pub async fn update_by_id(
        &self,
        identity: &Identity,
        id: &str,
        expected_revision: Option<i64>,
        update: &DocumentUpdate,
    ) -> TrellisResult<Option<Versioned<T>>> {
        let mut filters = vec![Filter::eq("id", id)];
        if let Some(revision) = expected_revision {
            filters.push(Filter::eq(REVISION_FIELD, revision));
        }
        self.update_first(identity, filters, &SortSpec::default(), update)
            .await
    }

    pub async fn update_all(
        &self,
        identity: &Identity,
        filters: Vec<Filter>,
        update: &DocumentUpdate,
    ) -> TrellisResult<u64> {
        self.store
            .update_all(T::COLLECTION, &self.scoped(identity, filters), update)
            .await
    }

    /// 游标分页查询
    ///
    /// 总数在游标生效前统计。多取一条用来判断是否还有下一页，所以最后一页的游标为空。
    /// 给出 `post_filter` 时存储层不做条数限制，筛选后再截断；此时总数不经过筛选，可能偏大。
    pub async fn list(
        &self,
        identity: &Identity,
        query: &ListQuery,
        extra_filters: Vec<Filter>,
        post_filter: Option<&(dyn Fn(&T) -> bool + Send + Sync)>,
    ) -> TrellisResult<Page<T>> {
        let collection = T::COLLECTION;
        let sort = collection.translate_sort(query.sort_by.as_deref(), query.order)?;

        let mut filters = query
            .filters
            .iter()
            .map(|(name, value)| collection.translate_filter(name, value))
            .collect::<TrellisResult<Vec<_>>>()?;
        filters.extend(extra_filters);
        let filters = self.scoped(identity, filters);

        let total = self.store.count(collection, &filters).await?;

        let limit = match query.limit {
            0 => DEFAULT_PAGE_SIZE,
            n => n.min(MAX_PAGE_SIZE),
        };
        let sort_kind = sort.field.as_ref().map(|f| f.kind);
        let spec = FindSpec {
            after: decode_cursor(&query.cursor, sort_kind)?,
            filters,
            limit: post_filter.is_none().then_some(limit + 1),
            sort,
        };

        let docs = self.store.find(collection, &spec).await?;
        let mut rows = Vec::with_capacity(docs.len());
        for doc in docs {
            let value: T = doc.decode()?;
            if post_filter.map_or(true, |keep| keep(&value)) {
                rows.push((doc, value));
            }
        }

        let has_more = rows.len() as u64 > limit;
        rows.truncate(limit as usize);

        let next_page_cursor = match (has_more, rows.last()) {
            (true, Some((doc, _))) => {
                let sort_value = spec.sort.field.as_ref().map(|field| {
                    (
                        field.kind,
                        doc.field(&field.path).cloned().unwrap_or(Value::Null),
                    )
                });
                encode_cursor(sort_value.as_ref().map(|(k, v)| (*k, v)), doc.oid)?
            }
            _ => String::new(),
        };

        let items: Vec<T> = rows.into_iter().map(|(_, value)| value).collect();
        debug!(
            collection = %collection,
            total,
            returned = items.len(),
            "分页查询完成"
        );

        Ok(Page {
            returned_result_size: items.len() as u64,
            total_result_size: total,
            next_page_cursor,
            items,
        })
    }
}
