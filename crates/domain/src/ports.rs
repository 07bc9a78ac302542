use std::sync::Arc;

use async_trait::async_trait;

use branchdb_errors::BranchResult;

use crate::document::{ApplyOutcome, Document, DocumentFilter, Mutation};
use crate::entities::PartitionEndpoint;
use crate::value_objects::{Collection, IdempotencyToken};

/// 文档存储接口：单个分区实例需要提供的能力
///
/// - 单文档/单批次原子写入（`apply`），并记录已应用的幂等令牌
/// - 按主键点查
/// - 带过滤条件的范围查询，结果按 (创建时间, 分支, 本地序号) 排序
///
/// 存储本身不提供跨分区事务。
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// 健康探测
    async fn ping(&self) -> BranchResult<()>;

    async fn get(&self, collection: Collection, key: &str) -> BranchResult<Option<Document>>;

    async fn find(
        &self,
        collection: Collection,
        filter: &DocumentFilter,
    ) -> BranchResult<Vec<Document>>;

    /// 原子地应用一批写操作。令牌已存在时直接返回 `Duplicate`，不做任何修改；
    /// 任意一个操作失败时整批回滚，且令牌不会被记录。
    async fn apply(
        &self,
        token: &IdempotencyToken,
        mutations: &[Mutation],
    ) -> BranchResult<ApplyOutcome>;

    async fn is_applied(&self, token: &IdempotencyToken) -> BranchResult<bool>;
}

/// 根据端点描述创建存储句柄
pub trait StoreConnector: Send + Sync {
    fn connect(&self, endpoint: &PartitionEndpoint) -> BranchResult<Arc<dyn DocumentStore>>;

    /// 端点不可达后重建句柄。数据只存在于句柄内部的存储返回 `None`，保留原句柄。
    fn reconnect(
        &self,
        endpoint: &PartitionEndpoint,
    ) -> BranchResult<Option<Arc<dyn DocumentStore>>> {
        self.connect(endpoint).map(Some)
    }
}
