use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use branchdb_domain::{
    Collection, DocumentFilter, DocumentStore, FieldExpectation, IdempotencyToken, Mutation,
    TransactionRecord, TxnState,
};
use branchdb_errors::{BranchError, BranchResult};

/// 跨分支事务记录的持久化接口
#[async_trait]
pub trait TransactionLog: Send + Sync {
    /// 新建记录，编号已存在时返回 DuplicateKey
    async fn create(&self, record: &TransactionRecord) -> BranchResult<()>;

    /// 覆盖已有记录。存储中的 revision 必须与 `record.revision` 一致，
    /// 否则说明记录已被其他执行者修改，返回 PreconditionFailed；
    /// 写入成功后 `record.revision` 加一。
    async fn update(&self, record: &mut TransactionRecord) -> BranchResult<()>;

    async fn get(&self, id: Uuid) -> BranchResult<Option<TransactionRecord>>;

    async fn list_by_state(&self, states: &[TxnState]) -> BranchResult<Vec<TransactionRecord>>;

    async fn remove(&self, id: Uuid) -> BranchResult<()>;
}

#[derive(Default)]
pub struct InMemoryTransactionLog {
    records: RwLock<HashMap<Uuid, TransactionRecord>>,
}

impl InMemoryTransactionLog {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TransactionLog for InMemoryTransactionLog {
    async fn create(&self, record: &TransactionRecord) -> BranchResult<()> {
        let mut records = self.records.write().await;
        if records.contains_key(&record.id) {
            return Err(BranchError::duplicate_key(
                Collection::Transaction.as_str(),
                record.id.to_string(),
            ));
        }
        records.insert(record.id, record.clone());
        Ok(())
    }

    async fn update(&self, record: &mut TransactionRecord) -> BranchResult<()> {
        let mut records = self.records.write().await;
        let stored = records
            .get(&record.id)
            .ok_or_else(|| BranchError::not_found(Collection::Transaction.as_str(), record.id.to_string()))?;
        if stored.revision != record.revision {
            return Err(stale_revision(record.id, stored.revision, record.revision));
        }
        record.revision += 1;
        records.insert(record.id, record.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> BranchResult<Option<TransactionRecord>> {
        Ok(self.records.read().await.get(&id).cloned())
    }

    async fn list_by_state(&self, states: &[TxnState]) -> BranchResult<Vec<TransactionRecord>> {
        let records = self.records.read().await;
        let mut matched: Vec<_> = records
            .values()
            .filter(|r| states.contains(&r.state))
            .cloned()
            .collect();
        matched.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(matched)
    }

    async fn remove(&self, id: Uuid) -> BranchResult<()> {
        self.records.write().await.remove(&id);
        Ok(())
    }
}

fn stale_revision(id: Uuid, stored: u64, expected: u64) -> BranchError {
    BranchError::PreconditionFailed(format!(
        "事务 {id} 的记录已被并发修改 (存储版本 {stored}，期望 {expected})"
    ))
}

/// 把事务记录作为文档保存在一个专用的协调器存储中，
/// 进程重启或运维进程都可以读取。
pub struct DocumentTransactionLog {
    store: Arc<dyn DocumentStore>,
}

impl DocumentTransactionLog {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl TransactionLog for DocumentTransactionLog {
    async fn create(&self, record: &TransactionRecord) -> BranchResult<()> {
        self.store
            .apply(
                &IdempotencyToken::random(),
                &[Mutation::Insert {
                    document: record.to_document()?,
                }],
            )
            .await?;
        Ok(())
    }

    async fn update(&self, record: &mut TransactionRecord) -> BranchResult<()> {
        let expected = record.revision;
        let mut next = record.clone();
        next.revision += 1;
        let result = self
            .store
            .apply(
                &IdempotencyToken::random(),
                &[
                    Mutation::Require {
                        collection: Collection::Transaction,
                        key: record.id.to_string(),
                        expect: Some(FieldExpectation::new("revision", expected)),
                    },
                    Mutation::Upsert {
                        document: next.to_document()?,
                    },
                ],
            )
            .await;
        match result {
            Ok(_) => {
                record.revision = next.revision;
                Ok(())
            }
            Err(BranchError::PreconditionFailed(_)) => {
                let stored = self.get(record.id).await?.map(|r| r.revision).unwrap_or_default();
                Err(stale_revision(record.id, stored, expected))
            }
            Err(e) => Err(e),
        }
    }

    async fn get(&self, id: Uuid) -> BranchResult<Option<TransactionRecord>> {
        self.store
            .get(Collection::Transaction, &id.to_string())
            .await?
            .map(|doc| TransactionRecord::from_document(&doc))
            .transpose()
    }

    async fn list_by_state(&self, states: &[TxnState]) -> BranchResult<Vec<TransactionRecord>> {
        let mut records = Vec::new();
        for state in states {
            let filter = DocumentFilter::new().field_eq("state", state.as_str());
            for doc in self.store.find(Collection::Transaction, &filter).await? {
                records.push(TransactionRecord::from_document(&doc)?);
            }
        }
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(records)
    }

    async fn remove(&self, id: Uuid) -> BranchResult<()> {
        self.store
            .apply(
                &IdempotencyToken::random(),
                &[Mutation::Delete {
                    collection: Collection::Transaction,
                    key: id.to_string(),
                }],
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use branchdb_domain::BranchId;
    use branchdb_infrastructure::{InMemoryStore, SqliteStore};

    async fn exercise(log: &dyn TransactionLog) {
        let mut record =
            TransactionRecord::new(Uuid::new_v4(), "place-purchase-order", BranchId::new("CN1"), vec![]);
        log.create(&record).await.unwrap();
        assert!(matches!(
            log.create(&record).await.unwrap_err(),
            BranchError::DuplicateKey { .. }
        ));

        let stale = record.clone();
        record.transition(TxnState::Failed);
        record.compensation_error = Some("分区 p2 不可用".to_string());
        log.update(&mut record).await.unwrap();
        assert_eq!(record.revision, 1);

        // 基于旧版本的写入不能覆盖已经持久化的终态
        let mut stale = stale;
        stale.transition(TxnState::Committed);
        assert!(matches!(
            log.update(&mut stale).await.unwrap_err(),
            BranchError::PreconditionFailed(_)
        ));
        assert_eq!(stale.revision, 0);

        let loaded = log.get(record.id).await.unwrap().unwrap();
        assert_eq!(loaded.state, TxnState::Failed);
        assert_eq!(loaded.compensation_error, record.compensation_error);

        let failed = log.list_by_state(&[TxnState::Failed]).await.unwrap();
        assert_eq!(failed.len(), 1);
        assert!(log
            .list_by_state(&[TxnState::Committed])
            .await
            .unwrap()
            .is_empty());

        log.remove(record.id).await.unwrap();
        assert!(log.get(record.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_in_memory_log() {
        exercise(&InMemoryTransactionLog::new()).await;
    }

    #[tokio::test]
    async fn test_document_log_on_memory_store() {
        exercise(&DocumentTransactionLog::new(Arc::new(InMemoryStore::new("txn")))).await;
    }

    #[tokio::test]
    async fn test_document_log_on_sqlite() {
        let store = SqliteStore::connect("sqlite::memory:").await.unwrap();
        exercise(&DocumentTransactionLog::new(Arc::new(store))).await;
    }
}
