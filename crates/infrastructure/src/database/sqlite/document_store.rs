use std::time::Instant;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::sqlite::{SqliteArguments, SqliteRow};
use sqlx::{Row, Sqlite, SqlitePool};
use tracing::{debug, trace};
use trellis_domain::collection::Collection;
use trellis_domain::query::{Filter, FindSpec, SortSpec};
use trellis_domain::repositories::{DocumentUpdate, ResourceStore, StoredDocument};
use trellis_errors::{ErrorKind, TrellisError, TrellisResult};

use super::sql::{cursor_clause, order_clause, update_expr, where_clause, Fragment, SqlArg};

/// 基于 SQLite JSON 文档表的资源存储
#[derive(Clone)]
pub struct SqliteResourceStore {
    pool: SqlitePool,
}

impl SqliteResourceStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn bind(fragment: &Fragment) -> sqlx::query::Query<'_, Sqlite, SqliteArguments<'_>> {
        let mut query = sqlx::query(&fragment.sql);
        for arg in &fragment.args {
            query = match arg {
                SqlArg::Null => query.bind(Option::<String>::None),
                SqlArg::Integer(i) => query.bind(*i),
                SqlArg::Real(f) => query.bind(*f),
                SqlArg::Text(s) => query.bind(s.as_str()),
            };
        }
        query
    }

    fn row_to_document(row: &SqliteRow) -> TrellisResult<StoredDocument> {
        let doc: String = row.try_get("doc")?;
        Ok(StoredDocument {
            oid: row.try_get("oid")?,
            revision: row.try_get("revision")?,
            body: serde_json::from_str(&doc)?,
        })
    }

    fn record(collection: Collection, operation: &'static str, started: Instant) {
        metrics::histogram!(
            "trellis_store_operation_seconds",
            "collection" => collection.name(),
            "operation" => operation
        )
        .record(started.elapsed().as_secs_f64());
    }
}

#[async_trait]
impl ResourceStore for SqliteResourceStore {
    async fn insert(&self, collection: Collection, body: Value) -> TrellisResult<StoredDocument> {
        let started = Instant::now();
        let id = body.get("id").and_then(Value::as_str).unwrap_or_default().to_string();

        let mut fragment = Fragment::new(format!("INSERT INTO {} (doc) VALUES (json(", collection.name()));
        fragment
            .push_arg(SqlArg::Text(serde_json::to_string(&body)?))
            .push(")) RETURNING oid, revision, doc");

        let row = match Self::bind(&fragment).fetch_one(&self.pool).await {
            Ok(row) => row,
            Err(e) => {
                let err = TrellisError::from(e);
                if err.kind() == ErrorKind::IdentifierTaken {
                    return Err(TrellisError::identifier_taken(format!("{collection} {id}")));
                }
                return Err(err);
            }
        };

        Self::record(collection, "insert", started);
        trace!(collection = %collection, id, "文档已插入");
        Self::row_to_document(&row)
    }

    async fn count(&self, collection: Collection, filters: &[Filter]) -> TrellisResult<u64> {
        let started = Instant::now();
        let mut fragment = Fragment::new(format!("SELECT COUNT(*) AS total FROM {} WHERE ", collection.name()));
        fragment.append(&where_clause(filters)?);

        let row = Self::bind(&fragment).fetch_one(&self.pool).await?;
        let total: i64 = row.try_get("total")?;
        Self::record(collection, "count", started);
        Ok(total.max(0) as u64)
    }

    async fn find(&self, collection: Collection, spec: &FindSpec) -> TrellisResult<Vec<StoredDocument>> {
        let started = Instant::now();
        let mut fragment = Fragment::new(format!(
            "SELECT oid, revision, doc FROM {} WHERE ",
            collection.name()
        ));
        fragment.append(&where_clause(&spec.filters)?);
        if let Some(after) = &spec.after {
            fragment.push(" AND ").append(&cursor_clause(&spec.sort, after)?);
        }
        fragment.append(&order_clause(&spec.sort)?);
        if let Some(limit) = spec.limit {
            fragment
                .push(" LIMIT ")
                .push_arg(SqlArg::Integer(limit.min(i64::MAX as u64) as i64));
        }

        let rows = Self::bind(&fragment).fetch_all(&self.pool).await?;
        Self::record(collection, "find", started);
        rows.iter().map(Self::row_to_document).collect()
    }

    async fn update_first(
        &self,
        collection: Collection,
        filters: &[Filter],
        sort: &SortSpec,
        update: &DocumentUpdate,
    ) -> TrellisResult<Option<StoredDocument>> {
        let started = Instant::now();
        let table = collection.name();
        let conditions = where_clause(filters)?;

        // 选取与修改在同一条语句内完成，SQLite 的写锁保证不会有两个调用方改到同一行
        let mut fragment = Fragment::new(format!("UPDATE {table} SET doc = "));
        fragment
            .append(&update_expr(update)?)
            .push(&format!(
                ", revision = revision + 1 WHERE oid = (SELECT oid FROM {table} WHERE "
            ))
            .append(&conditions)
            .append(&order_clause(sort)?)
            .push(" LIMIT 1) AND ")
            .append(&conditions)
            .push(" RETURNING oid, revision, doc");

        let row = Self::bind(&fragment).fetch_optional(&self.pool).await?;
        Self::record(collection, "update_first", started);
        match row {
            Some(row) => {
                let doc = Self::row_to_document(&row)?;
                debug!(collection = %collection, oid = doc.oid, revision = doc.revision, "条件更新命中");
                Ok(Some(doc))
            }
            None => Ok(None),
        }
    }

    async fn update_all(
        &self,
        collection: Collection,
        filters: &[Filter],
        update: &DocumentUpdate,
    ) -> TrellisResult<u64> {
        if update.is_empty() {
            return Ok(0);
        }
        let started = Instant::now();
        let mut fragment = Fragment::new(format!("UPDATE {} SET doc = ", collection.name()));
        fragment
            .append(&update_expr(update)?)
            .push(", revision = revision + 1 WHERE ")
            .append(&where_clause(filters)?);

        let result = Self::bind(&fragment).execute(&self.pool).await?;
        Self::record(collection, "update_all", started);
        debug!(collection = %collection, affected = result.rows_affected(), "批量更新完成");
        Ok(result.rows_affected())
    }
}
