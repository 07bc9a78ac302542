use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use branchdb_domain::{
    merge_order, ApplyOutcome, Collection, Document, DocumentFilter, DocumentStore,
    IdempotencyToken, Mutation,
};
use branchdb_errors::BranchResult;

use crate::batch::{apply_batch, BatchTarget};

type DocKey = (Collection, String);

#[derive(Default)]
struct MemoryState {
    documents: BTreeMap<DocKey, Document>,
    applied: HashSet<IdempotencyToken>,
    next_seq: i64,
}

/// 进程内文档存储，语义与 SQLite 存储一致，用于测试和演示拓扑
pub struct InMemoryStore {
    name: String,
    state: Mutex<MemoryState>,
}

impl InMemoryStore {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(MemoryState::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.documents.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

/// 批次暂存区：读取先查暂存再查基础数据，成功后一次性合并
struct Staged<'a> {
    base: &'a MemoryState,
    overlay: HashMap<DocKey, Option<Document>>,
    next_seq: i64,
}

#[async_trait]
impl BatchTarget for Staged<'_> {
    async fn load(&mut self, collection: Collection, key: &str) -> BranchResult<Option<Document>> {
        let doc_key = (collection, key.to_string());
        if let Some(staged) = self.overlay.get(&doc_key) {
            return Ok(staged.clone());
        }
        Ok(self.base.documents.get(&doc_key).cloned())
    }

    async fn insert(&mut self, mut document: Document) -> BranchResult<()> {
        self.next_seq += 1;
        document.seq = self.next_seq;
        self.overlay
            .insert((document.collection, document.key.clone()), Some(document));
        Ok(())
    }

    async fn replace(&mut self, document: Document) -> BranchResult<()> {
        self.overlay
            .insert((document.collection, document.key.clone()), Some(document));
        Ok(())
    }

    async fn remove(&mut self, collection: Collection, key: &str) -> BranchResult<()> {
        self.overlay.insert((collection, key.to_string()), None);
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for InMemoryStore {
    async fn ping(&self) -> BranchResult<()> {
        Ok(())
    }

    async fn get(&self, collection: Collection, key: &str) -> BranchResult<Option<Document>> {
        let state = self.state.lock().await;
        Ok(state
            .documents
            .get(&(collection, key.to_string()))
            .cloned())
    }

    async fn find(
        &self,
        collection: Collection,
        filter: &DocumentFilter,
    ) -> BranchResult<Vec<Document>> {
        let state = self.state.lock().await;
        let mut documents: Vec<Document> = state
            .documents
            .range((collection, String::new())..)
            .take_while(|((c, _), _)| *c == collection)
            .map(|(_, doc)| doc)
            .filter(|doc| filter.matches(doc))
            .cloned()
            .collect();
        documents.sort_by(merge_order);
        if let Some(limit) = filter.limit {
            documents.truncate(limit);
        }
        Ok(documents)
    }

    async fn apply(
        &self,
        token: &IdempotencyToken,
        mutations: &[Mutation],
    ) -> BranchResult<ApplyOutcome> {
        let mut state = self.state.lock().await;
        if state.applied.contains(token) {
            debug!("存储 {} 跳过重复令牌 {}", self.name, token);
            return Ok(ApplyOutcome::Duplicate);
        }

        let mut staged = Staged {
            base: &*state,
            overlay: HashMap::new(),
            next_seq: state.next_seq,
        };
        apply_batch(&mut staged, mutations).await?;
        let Staged {
            overlay, next_seq, ..
        } = staged;

        for (key, document) in overlay {
            match document {
                Some(document) => {
                    state.documents.insert(key, document);
                }
                None => {
                    state.documents.remove(&key);
                }
            }
        }
        state.next_seq = next_seq;
        state.applied.insert(token.clone());
        Ok(ApplyOutcome::Applied)
    }

    async fn is_applied(&self, token: &IdempotencyToken) -> BranchResult<bool> {
        Ok(self.state.lock().await.applied.contains(token))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use branchdb_domain::{BranchId, Entity, FieldExpectation, StockLevel, Warehouse};
    use branchdb_errors::BranchError;

    fn warehouse(code: &str, branch: &str) -> Document {
        Warehouse::new(code, "Kho", "Hà Nội", BranchId::new(branch))
            .to_document()
            .unwrap()
    }

    fn adjust(warehouse: &str, item: &str, delta: i64) -> Mutation {
        Mutation::AdjustStock {
            branch: BranchId::new("CN1"),
            warehouse: warehouse.to_string(),
            item: item.to_string(),
            delta,
        }
    }

    async fn quantity(store: &InMemoryStore, warehouse: &str, item: &str) -> i64 {
        let doc = store
            .get(Collection::Inventory, &branchdb_domain::stock_key(warehouse, item))
            .await
            .unwrap()
            .unwrap();
        StockLevel::from_document(&doc).unwrap().quantity
    }

    #[tokio::test]
    async fn test_duplicate_token_is_noop() {
        let store = InMemoryStore::new("p1");
        let token = IdempotencyToken::new("t-1");
        let batch = vec![adjust("KHO1", "VT01", 10)];

        assert_eq!(store.apply(&token, &batch).await.unwrap(), ApplyOutcome::Applied);
        assert_eq!(store.apply(&token, &batch).await.unwrap(), ApplyOutcome::Duplicate);
        assert_eq!(quantity(&store, "KHO1", "VT01").await, 10);
        assert!(store.is_applied(&token).await.unwrap());
    }

    #[tokio::test]
    async fn test_failed_batch_leaves_no_trace() {
        let store = InMemoryStore::new("p1");
        store
            .apply(&IdempotencyToken::random(), &[adjust("KHO1", "VT01", 5)])
            .await
            .unwrap();

        let token = IdempotencyToken::new("t-2");
        let batch = vec![
            Mutation::Insert {
                document: warehouse("KHO9", "CN1"),
            },
            adjust("KHO1", "VT01", -3),
            adjust("KHO1", "VT02", -1),
        ];
        let err = store.apply(&token, &batch).await.unwrap_err();
        assert!(matches!(err, BranchError::InsufficientStock { .. }));

        assert!(store.get(Collection::Warehouse, "KHO9").await.unwrap().is_none());
        assert_eq!(quantity(&store, "KHO1", "VT01").await, 5);
        assert!(!store.is_applied(&token).await.unwrap());
    }

    #[tokio::test]
    async fn test_insert_existing_key_rejected() {
        let store = InMemoryStore::new("p1");
        let insert = Mutation::Insert {
            document: warehouse("KHO1", "CN1"),
        };
        store
            .apply(&IdempotencyToken::random(), std::slice::from_ref(&insert))
            .await
            .unwrap();
        let err = store
            .apply(&IdempotencyToken::random(), &[insert])
            .await
            .unwrap_err();
        assert!(matches!(err, BranchError::DuplicateKey { .. }));
    }

    #[tokio::test]
    async fn test_require_and_patch() {
        let store = InMemoryStore::new("p1");
        store
            .apply(
                &IdempotencyToken::random(),
                &[Mutation::Insert {
                    document: warehouse("KHO1", "CN1"),
                }],
            )
            .await
            .unwrap();

        let require_missing = Mutation::Require {
            collection: Collection::Warehouse,
            key: "KHO2".to_string(),
            expect: None,
        };
        let err = store
            .apply(&IdempotencyToken::random(), &[require_missing])
            .await
            .unwrap_err();
        assert!(matches!(err, BranchError::DocumentNotFound { .. }));

        store
            .apply(
                &IdempotencyToken::random(),
                &[Mutation::patch(Collection::Warehouse, "KHO1", "name", "Kho chính")],
            )
            .await
            .unwrap();
        let guarded = Mutation::Require {
            collection: Collection::Warehouse,
            key: "KHO1".to_string(),
            expect: Some(FieldExpectation::new("name", "Kho chính")),
        };
        store
            .apply(&IdempotencyToken::random(), &[guarded])
            .await
            .unwrap();

        let doc = store.get(Collection::Warehouse, "KHO1").await.unwrap().unwrap();
        assert_eq!(doc.version, 2);
    }

    #[tokio::test]
    async fn test_find_orders_and_limits() {
        let store = InMemoryStore::new("p1");
        for code in ["KHO3", "KHO1", "KHO2"] {
            store
                .apply(
                    &IdempotencyToken::random(),
                    &[Mutation::Insert {
                        document: warehouse(code, "CN1"),
                    }],
                )
                .await
                .unwrap();
        }
        let all = store
            .find(Collection::Warehouse, &DocumentFilter::new())
            .await
            .unwrap();
        assert_eq!(all.len(), 3);
        assert!(all.windows(2).all(|w| merge_order(&w[0], &w[1]).is_le()));
        let codes: Vec<_> = all.iter().map(|d| d.key.as_str()).collect();
        assert_eq!(codes, vec!["KHO3", "KHO1", "KHO2"]);

        let limited = store
            .find(Collection::Warehouse, &DocumentFilter::new().limit(2))
            .await
            .unwrap();
        assert_eq!(limited.len(), 2);
        assert!(store
            .find(Collection::PurchaseOrder, &DocumentFilter::new())
            .await
            .unwrap()
            .is_empty());
    }
}
