use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use tracing::{debug, info};
use trellis_core::config::DatabaseConfig;
use trellis_domain::collection::Collection;

use super::sqlite::SqliteResourceStore;

/// 每个集合一张文档表
const DOCUMENT_TABLE: &str = "CREATE TABLE IF NOT EXISTS {table} (
    oid INTEGER PRIMARY KEY AUTOINCREMENT,
    revision INTEGER NOT NULL DEFAULT 0,
    doc TEXT NOT NULL CHECK (json_valid(doc))
)";

/// 索引表达式必须与查询里生成的表达式逐字一致才会被使用
fn index_statements(collection: Collection) -> Vec<String> {
    let table = collection.name();
    let mut statements = vec![format!(
        "CREATE UNIQUE INDEX IF NOT EXISTS {table}_id ON {table} (json_extract(doc, '$.\"id\"'))"
    )];
    let mut secondary = |name: &str, path: &str| {
        statements.push(format!(
            "CREATE INDEX IF NOT EXISTS {table}_{name} ON {table} (json_extract(doc, '$.\"{path}\"'))"
        ));
    };

    match collection {
        Collection::Users => secondary("api_key", "api-key"),
        Collection::Datasets | Collection::Modules => {
            secondary("user", "user");
            secondary("status", "status");
            secondary("source", "source");
            secondary("process", "process");
        }
        Collection::Jobs => {
            secondary("user", "user");
            secondary("status", "status");
            secondary("process", "process");
        }
        Collection::Tasks => {
            secondary("user", "user");
            secondary("job", "job");
            secondary("status", "status");
            secondary("process", "process");
        }
        Collection::Processes => {
            secondary("status", "status");
            secondary("type", "type");
        }
    }
    statements
}

pub struct DatabaseManager {
    pool: SqlitePool,
}

impl DatabaseManager {
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        let in_memory = config.url.contains(":memory:") || config.url.contains("mode=memory");

        let options = SqliteConnectOptions::from_str(&config.url)
            .with_context(|| format!("无效的数据库地址: {}", config.url))?
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(Duration::from_millis(config.busy_timeout_ms));
        let options = if in_memory {
            options
        } else {
            options
                .journal_mode(SqliteJournalMode::Wal)
                .synchronous(SqliteSynchronous::Normal)
        };

        // 内存库只存在于单个连接内，连接池必须固定为一个且永不回收
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new()
                .max_connections(config.max_connections)
                .min_connections(config.min_connections)
                .idle_timeout(Duration::from_secs(config.idle_timeout_seconds))
                .max_lifetime(Duration::from_secs(1800)) // 30分钟默认生命周期
        };

        let pool = pool_options
            .acquire_timeout(Duration::from_secs(config.connection_timeout_seconds))
            .connect_with(options)
            .await
            .with_context(|| format!("连接数据库失败: {}", config.url))?;

        info!(url = %config.url, in_memory, "数据库连接池已建立");
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn resource_store(&self) -> SqliteResourceStore {
        SqliteResourceStore::new(self.pool.clone())
    }

    /// 建表与建索引，可重复执行
    pub async fn migrate(&self) -> Result<()> {
        let mut tx = self.pool.begin().await.context("开启迁移事务失败")?;
        for collection in Collection::ALL {
            let table = DOCUMENT_TABLE.replace("{table}", collection.name());
            sqlx::query(&table)
                .execute(&mut *tx)
                .await
                .with_context(|| format!("创建表 {collection} 失败"))?;
            for statement in index_statements(collection) {
                sqlx::query(&statement)
                    .execute(&mut *tx)
                    .await
                    .with_context(|| format!("创建索引失败: {statement}"))?;
            }
            debug!(collection = %collection, "集合表已就绪");
        }
        tx.commit().await.context("提交迁移事务失败")?;
        info!("数据库迁移完成");
        Ok(())
    }

    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}
