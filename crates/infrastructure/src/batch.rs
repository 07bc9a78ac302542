use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Map, Value};

use branchdb_domain::{
    adjusted_quantity, apply_patch, stock_key, Collection, Document, Entity, Mutation,
    StockLevel,
};
use branchdb_errors::{BranchError, BranchResult};

/// 一次原子批次的写入目标。实现方负责在批次失败时丢弃所有暂存修改。
#[async_trait]
pub(crate) trait BatchTarget: Send {
    async fn load(&mut self, collection: Collection, key: &str) -> BranchResult<Option<Document>>;

    /// 写入新文档，由存储分配本地序号
    async fn insert(&mut self, document: Document) -> BranchResult<()>;

    /// 覆盖已有文档（保留序号）
    async fn replace(&mut self, document: Document) -> BranchResult<()>;

    async fn remove(&mut self, collection: Collection, key: &str) -> BranchResult<()>;
}

/// 按顺序执行一批写操作，任意一步失败立即返回错误
pub(crate) async fn apply_batch<T: BatchTarget>(
    target: &mut T,
    mutations: &[Mutation],
) -> BranchResult<()> {
    for mutation in mutations {
        apply_one(target, mutation).await?;
    }
    Ok(())
}

async fn apply_one<T: BatchTarget>(target: &mut T, mutation: &Mutation) -> BranchResult<()> {
    match mutation {
        Mutation::Insert { document } => {
            if target.load(document.collection, &document.key).await?.is_some() {
                return Err(BranchError::duplicate_key(
                    document.collection.as_str(),
                    document.key.clone(),
                ));
            }
            let mut document = document.clone();
            document.version = 1;
            target.insert(document).await
        }
        Mutation::Upsert { document } => {
            match target.load(document.collection, &document.key).await? {
                Some(existing) => {
                    let mut next = document.clone();
                    next.seq = existing.seq;
                    next.created_at = existing.created_at;
                    next.version = existing.version + 1;
                    target.replace(next).await
                }
                None => {
                    let mut document = document.clone();
                    document.version = 1;
                    target.insert(document).await
                }
            }
        }
        Mutation::Delete { collection, key } => target.remove(*collection, key).await,
        Mutation::Patch {
            collection,
            key,
            fields,
        } => {
            let mut document = target
                .load(*collection, key)
                .await?
                .ok_or_else(|| BranchError::not_found(collection.as_str(), key.clone()))?;
            apply_patch(&mut document, fields)?;
            target.replace(document).await
        }
        Mutation::Require {
            collection,
            key,
            expect,
        } => {
            let document = target
                .load(*collection, key)
                .await?
                .ok_or_else(|| BranchError::not_found(collection.as_str(), key.clone()))?;
            match expect {
                Some(expectation) => expectation.check(&document),
                None => Ok(()),
            }
        }
        Mutation::AdjustStock {
            branch,
            warehouse,
            item,
            delta,
        } => {
            let key = stock_key(warehouse, item);
            match target.load(Collection::Inventory, &key).await? {
                Some(mut document) => {
                    let current = document
                        .field("quantity")
                        .and_then(Value::as_i64)
                        .unwrap_or(0);
                    let next = adjusted_quantity(warehouse, item, current, *delta)?;
                    let mut fields = Map::new();
                    fields.insert("quantity".to_string(), Value::from(next));
                    apply_patch(&mut document, &fields)?;
                    target.replace(document).await
                }
                None => {
                    let quantity = adjusted_quantity(warehouse, item, 0, *delta)?;
                    let level = StockLevel {
                        warehouse: warehouse.clone(),
                        item: item.clone(),
                        quantity,
                        branch: branch.clone(),
                        created_at: Utc::now(),
                    };
                    let mut document = level.to_document()?;
                    document.version = 1;
                    target.insert(document).await
                }
            }
        }
    }
}
