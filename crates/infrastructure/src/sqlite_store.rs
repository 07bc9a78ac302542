use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool, Transaction};
use tokio::sync::OnceCell;
use tracing::debug;

use branchdb_domain::{
    ApplyOutcome, BranchId, Collection, Document, DocumentFilter, DocumentStore,
    IdempotencyToken, Mutation,
};
use branchdb_errors::{BranchError, BranchResult};

use crate::batch::{apply_batch, BatchTarget};

const SELECT_COLUMNS: &str =
    "SELECT seq, collection, doc_key, branch, created_at_ns, version, body FROM documents";

/// 基于 sqlx 的 SQLite 文档存储。每个批次在一个数据库事务中执行，
/// 幂等令牌与数据修改在同一事务内提交。
pub struct SqliteStore {
    pool: SqlitePool,
    schema: OnceCell<()>,
}

impl SqliteStore {
    /// 延迟连接：第一次使用时才建立连接并创建表结构
    pub fn connect_lazy(url: &str) -> BranchResult<Self> {
        let in_memory = url.contains(":memory:") || url.contains("mode=memory");
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5));
        let options = if in_memory {
            options
        } else {
            options.journal_mode(SqliteJournalMode::Wal)
        };

        // 内存数据库只能有一个连接，且连接不能被回收
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(0)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new()
                .max_connections(5)
                .max_lifetime(Duration::from_secs(1800))
        };

        Ok(Self {
            pool: pool_options.connect_lazy_with(options),
            schema: OnceCell::new(),
        })
    }

    pub async fn connect(url: &str) -> BranchResult<Self> {
        let store = Self::connect_lazy(url)?;
        store.ensure_schema().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn ensure_schema(&self) -> BranchResult<()> {
        self.schema
            .get_or_try_init(|| async {
                run_migrations(&self.pool).await?;
                Ok::<(), BranchError>(())
            })
            .await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

async fn run_migrations(pool: &SqlitePool) -> BranchResult<()> {
    debug!("初始化 SQLite 文档存储表结构");

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS documents (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            collection TEXT NOT NULL,
            doc_key TEXT NOT NULL,
            branch TEXT NOT NULL,
            created_at_ns INTEGER NOT NULL,
            version INTEGER NOT NULL DEFAULT 1,
            body TEXT NOT NULL,
            UNIQUE (collection, doc_key)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_documents_order ON documents (collection, created_at_ns, branch, seq)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS applied_tokens (
            token TEXT PRIMARY KEY,
            applied_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

fn to_nanos(at: DateTime<Utc>) -> BranchResult<i64> {
    at.timestamp_nanos_opt()
        .ok_or_else(|| BranchError::validation_error(format!("创建时间超出可存储范围: {at}")))
}

fn from_nanos(nanos: i64) -> BranchResult<DateTime<Utc>> {
    let secs = nanos.div_euclid(1_000_000_000);
    let subsec = nanos.rem_euclid(1_000_000_000) as u32;
    DateTime::from_timestamp(secs, subsec)
        .ok_or_else(|| BranchError::Internal(format!("无效的创建时间: {nanos}")))
}

fn map_row(row: &SqliteRow) -> BranchResult<Document> {
    let collection: String = row.try_get("collection")?;
    let collection = Collection::parse(&collection)
        .ok_or_else(|| BranchError::Internal(format!("未知集合: {collection}")))?;
    let branch: String = row.try_get("branch")?;
    let body: String = row.try_get("body")?;
    Ok(Document {
        collection,
        key: row.try_get("doc_key")?,
        branch: BranchId::new(branch),
        created_at: from_nanos(row.try_get("created_at_ns")?)?,
        seq: row.try_get("seq")?,
        version: row.try_get("version")?,
        body: serde_json::from_str(&body)?,
    })
}

struct SqliteBatch<'c> {
    tx: Transaction<'c, Sqlite>,
}

#[async_trait]
impl BatchTarget for SqliteBatch<'_> {
    async fn load(&mut self, collection: Collection, key: &str) -> BranchResult<Option<Document>> {
        let row = sqlx::query(&format!(
            "{SELECT_COLUMNS} WHERE collection = ? AND doc_key = ?"
        ))
        .bind(collection.as_str())
        .bind(key)
        .fetch_optional(&mut *self.tx)
        .await?;
        row.as_ref().map(map_row).transpose()
    }

    async fn insert(&mut self, document: Document) -> BranchResult<()> {
        sqlx::query(
            r#"
            INSERT INTO documents (collection, doc_key, branch, created_at_ns, version, body)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(document.collection.as_str())
        .bind(&document.key)
        .bind(document.branch.as_str())
        .bind(to_nanos(document.created_at)?)
        .bind(document.version)
        .bind(serde_json::to_string(&document.body)?)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn replace(&mut self, document: Document) -> BranchResult<()> {
        sqlx::query(
            r#"
            UPDATE documents SET branch = ?, created_at_ns = ?, version = ?, body = ?
            WHERE collection = ? AND doc_key = ?
            "#,
        )
        .bind(document.branch.as_str())
        .bind(to_nanos(document.created_at)?)
        .bind(document.version)
        .bind(serde_json::to_string(&document.body)?)
        .bind(document.collection.as_str())
        .bind(&document.key)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn remove(&mut self, collection: Collection, key: &str) -> BranchResult<()> {
        sqlx::query("DELETE FROM documents WHERE collection = ? AND doc_key = ?")
            .bind(collection.as_str())
            .bind(key)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for SqliteStore {
    async fn ping(&self) -> BranchResult<()> {
        self.ensure_schema().await?;
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn get(&self, collection: Collection, key: &str) -> BranchResult<Option<Document>> {
        self.ensure_schema().await?;
        let row = sqlx::query(&format!(
            "{SELECT_COLUMNS} WHERE collection = ? AND doc_key = ?"
        ))
        .bind(collection.as_str())
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(map_row).transpose()
    }

    async fn find(
        &self,
        collection: Collection,
        filter: &DocumentFilter,
    ) -> BranchResult<Vec<Document>> {
        self.ensure_schema().await?;

        let mut query: QueryBuilder<Sqlite> = QueryBuilder::new(SELECT_COLUMNS);
        query.push(" WHERE collection = ");
        query.push_bind(collection.as_str());
        if !filter.branches.is_empty() {
            query.push(" AND branch IN (");
            let mut separated = query.separated(", ");
            for branch in &filter.branches {
                separated.push_bind(branch.as_str().to_string());
            }
            separated.push_unseparated(")");
        }
        if let Some(from) = filter.created_from {
            query.push(" AND created_at_ns >= ");
            query.push_bind(to_nanos(from)?);
        }
        if let Some(until) = filter.created_until {
            query.push(" AND created_at_ns < ");
            query.push_bind(to_nanos(until)?);
        }
        query.push(" ORDER BY created_at_ns, branch, seq");

        let rows = query.build().fetch_all(&self.pool).await?;
        let mut documents = Vec::with_capacity(rows.len());
        for row in &rows {
            let document = map_row(row)?;
            // 字段相等条件作用于 JSON 主体，在内存中过滤
            if filter.matches(&document) {
                documents.push(document);
                if filter.limit.is_some_and(|limit| documents.len() >= limit) {
                    break;
                }
            }
        }
        Ok(documents)
    }

    async fn apply(
        &self,
        token: &IdempotencyToken,
        mutations: &[Mutation],
    ) -> BranchResult<ApplyOutcome> {
        self.ensure_schema().await?;
        // 一开始就取得写锁，避免读后升级写锁时遇到 SQLITE_BUSY_SNAPSHOT
        let mut tx = self.pool.begin_with("BEGIN IMMEDIATE").await?;

        let seen = sqlx::query("SELECT 1 FROM applied_tokens WHERE token = ?")
            .bind(token.as_str())
            .fetch_optional(&mut *tx)
            .await?;
        if seen.is_some() {
            tx.rollback().await?;
            debug!("SQLite 存储跳过重复令牌 {}", token);
            return Ok(ApplyOutcome::Duplicate);
        }

        // 出错时 batch 被丢弃，事务自动回滚
        let mut batch = SqliteBatch { tx };
        apply_batch(&mut batch, mutations).await?;

        sqlx::query("INSERT INTO applied_tokens (token, applied_at) VALUES (?, ?)")
            .bind(token.as_str())
            .bind(Utc::now().to_rfc3339())
            .execute(&mut *batch.tx)
            .await?;
        batch.tx.commit().await?;
        Ok(ApplyOutcome::Applied)
    }

    async fn is_applied(&self, token: &IdempotencyToken) -> BranchResult<bool> {
        self.ensure_schema().await?;
        let row = sqlx::query("SELECT 1 FROM applied_tokens WHERE token = ?")
            .bind(token.as_str())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use branchdb_domain::{Entity, StockLevel, Warehouse};
    use tempfile::TempDir;

    fn adjust(delta: i64) -> Mutation {
        Mutation::AdjustStock {
            branch: BranchId::new("CN2"),
            warehouse: "KHO2".to_string(),
            item: "VT01".to_string(),
            delta,
        }
    }

    #[tokio::test]
    async fn test_sqlite_store_honors_batch_contract() {
        let store = SqliteStore::connect("sqlite::memory:").await.unwrap();
        let warehouse = Warehouse::new("KHO2", "Kho 2", "TP.HCM", BranchId::new("CN2"));
        let token = IdempotencyToken::new("seed");
        let batch = vec![
            Mutation::Insert {
                document: warehouse.to_document().unwrap(),
            },
            adjust(100),
        ];
        assert_eq!(store.apply(&token, &batch).await.unwrap(), ApplyOutcome::Applied);
        assert_eq!(store.apply(&token, &batch).await.unwrap(), ApplyOutcome::Duplicate);

        let err = store
            .apply(&IdempotencyToken::new("too-much"), &[adjust(-30), adjust(-80)])
            .await
            .unwrap_err();
        assert!(matches!(err, BranchError::InsufficientStock { available: 70, .. }));
        assert!(!store
            .is_applied(&IdempotencyToken::new("too-much"))
            .await
            .unwrap());

        let doc = store
            .get(Collection::Inventory, "KHO2/VT01")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(StockLevel::from_document(&doc).unwrap().quantity, 100);

        let stored = store.get(Collection::Warehouse, "KHO2").await.unwrap().unwrap();
        assert_eq!(stored.created_at, warehouse.created_at);
        assert_eq!(Warehouse::from_document(&stored).unwrap(), warehouse);
    }

    #[tokio::test]
    async fn test_sqlite_concurrent_writers_all_apply() {
        let dir = TempDir::new().unwrap();
        let url = format!("sqlite://{}", dir.path().join("p2.db").display());
        let store = std::sync::Arc::new(SqliteStore::connect(&url).await.unwrap());

        let writers: Vec<_> = (0..20)
            .map(|i| {
                let store = store.clone();
                tokio::spawn(async move {
                    store
                        .apply(&IdempotencyToken::new(format!("restock-{i}")), &[adjust(1)])
                        .await
                })
            })
            .collect();
        for writer in writers {
            assert_eq!(writer.await.unwrap().unwrap(), ApplyOutcome::Applied);
        }

        let doc = store
            .get(Collection::Inventory, "KHO2/VT01")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(StockLevel::from_document(&doc).unwrap().quantity, 20);
    }

    #[tokio::test]
    async fn test_sqlite_find_filters_by_branch_and_field() {
        let dir = TempDir::new().unwrap();
        let url = format!("sqlite://{}", dir.path().join("p1.db").display());
        let store = SqliteStore::connect(&url).await.unwrap();

        for (code, branch) in [("KHO1", "CN1"), ("KHO3", "CN3"), ("KHO4", "CN1")] {
            let doc = Warehouse::new(code, code, "addr", BranchId::new(branch))
                .to_document()
                .unwrap();
            store
                .apply(&IdempotencyToken::random(), &[Mutation::Insert { document: doc }])
                .await
                .unwrap();
        }

        let cn1 = store
            .find(
                Collection::Warehouse,
                &DocumentFilter::new().branch(BranchId::new("CN1")),
            )
            .await
            .unwrap();
        let codes: Vec<_> = cn1.iter().map(|d| d.key.as_str()).collect();
        assert_eq!(codes, vec!["KHO1", "KHO4"]);

        let by_code = store
            .find(
                Collection::Warehouse,
                &DocumentFilter::new().field_eq("code", "KHO3").limit(5),
            )
            .await
            .unwrap();
        assert_eq!(by_code.len(), 1);
        assert_eq!(by_code[0].branch, BranchId::new("CN3"));

        // 数据在重新连接后仍然存在
        store.close().await;
        let reopened = SqliteStore::connect(&url).await.unwrap();
        assert!(reopened
            .get(Collection::Warehouse, "KHO4")
            .await
            .unwrap()
            .is_some());
    }
}
