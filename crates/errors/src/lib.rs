use thiserror::Error;

/// 分支路由层统一错误类型
#[derive(Debug, Error)]
pub enum BranchError {
    #[error("未知分支: {branch}")]
    UnknownBranch { branch: String },
    #[error("未知分区: {partition}")]
    UnknownPartition { partition: String },
    #[error("分区不可用: {partition} - {reason}")]
    PartitionUnavailable { partition: String, reason: String },
    #[error("子操作失败: 分区 {partition} 上的 {operation} - {reason}")]
    SubOperationFailed {
        partition: String,
        operation: String,
        reason: String,
    },
    #[error("补偿失败，需要人工介入: 事务 {txn_id} - {reason}")]
    CompensationFailed { txn_id: String, reason: String },
    #[error("跨分区事务已回滚: 事务 {txn_id} - {reason}")]
    TransactionAborted { txn_id: String, reason: String },
    #[error("主键冲突: {collection}/{key}")]
    DuplicateKey { collection: String, key: String },
    #[error("文档未找到: {collection}/{key}")]
    DocumentNotFound { collection: String, key: String },
    #[error("库存不足: 仓库 {warehouse} 商品 {item} 需要 {requested}，可用 {available}")]
    InsufficientStock {
        warehouse: String,
        item: String,
        requested: i64,
        available: i64,
    },
    #[error("前置条件不满足: {0}")]
    PreconditionFailed(String),
    #[error("数据验证失败: {0}")]
    Validation(String),
    #[error("配置错误: {0}")]
    Configuration(String),
    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),
    #[error("序列化错误: {0}")]
    Serialization(String),
    #[error("操作超时: {0}")]
    Timeout(String),
    #[error("内部错误: {0}")]
    Internal(String),
}

pub type BranchResult<T> = Result<T, BranchError>;

impl BranchError {
    pub fn unknown_branch<S: Into<String>>(branch: S) -> Self {
        Self::UnknownBranch {
            branch: branch.into(),
        }
    }
    pub fn unknown_partition<S: Into<String>>(partition: S) -> Self {
        Self::UnknownPartition {
            partition: partition.into(),
        }
    }
    pub fn unavailable<P: Into<String>, R: Into<String>>(partition: P, reason: R) -> Self {
        Self::PartitionUnavailable {
            partition: partition.into(),
            reason: reason.into(),
        }
    }
    pub fn duplicate_key<C: Into<String>, K: Into<String>>(collection: C, key: K) -> Self {
        Self::DuplicateKey {
            collection: collection.into(),
            key: key.into(),
        }
    }
    pub fn not_found<C: Into<String>, K: Into<String>>(collection: C, key: K) -> Self {
        Self::DocumentNotFound {
            collection: collection.into(),
            key: key.into(),
        }
    }
    pub fn config_error<S: Into<String>>(msg: S) -> Self {
        Self::Configuration(msg.into())
    }
    pub fn validation_error<S: Into<String>>(msg: S) -> Self {
        Self::Validation(msg.into())
    }

    /// 瞬时故障，可以携带同一个幂等令牌重放
    pub fn is_retryable(&self) -> bool {
        match self {
            BranchError::PartitionUnavailable { .. } | BranchError::Timeout(_) => true,
            BranchError::Database(e) => match e {
                sqlx::Error::Io(_)
                | sqlx::Error::PoolTimedOut
                | sqlx::Error::PoolClosed
                | sqlx::Error::WorkerCrashed => true,
                sqlx::Error::Database(db) => is_lock_contention(db.code().as_deref()),
                _ => false,
            },
            _ => false,
        }
    }

    /// 业务层拒绝（库存不足、主键冲突等），触发补偿但不重试
    pub fn is_business_rejection(&self) -> bool {
        matches!(
            self,
            BranchError::SubOperationFailed { .. }
                | BranchError::DuplicateKey { .. }
                | BranchError::DocumentNotFound { .. }
                | BranchError::InsufficientStock { .. }
                | BranchError::PreconditionFailed(_)
                | BranchError::Validation(_)
        )
    }

    /// 需要人工介入的终态错误
    pub fn requires_manual_intervention(&self) -> bool {
        matches!(self, BranchError::CompensationFailed { .. })
    }

    pub fn user_message(&self) -> &str {
        match self {
            BranchError::UnknownBranch { .. } => "请求的分支不存在",
            BranchError::PartitionUnavailable { .. } => "分支数据库暂时不可用，请稍后重试",
            BranchError::InsufficientStock { .. } => "库存不足",
            BranchError::DuplicateKey { .. } => "单据编号已存在",
            BranchError::Validation(_) => "输入数据验证失败",
            BranchError::TransactionAborted { .. } => "跨分支操作未完成，已自动回滚",
            BranchError::CompensationFailed { .. } => "跨分支操作处于不一致状态，请联系管理员",
            _ => "系统繁忙，请稍后重试",
        }
    }
}

impl From<serde_json::Error> for BranchError {
    fn from(err: serde_json::Error) -> Self {
        BranchError::Serialization(err.to_string())
    }
}

impl From<anyhow::Error> for BranchError {
    fn from(err: anyhow::Error) -> Self {
        BranchError::Internal(err.to_string())
    }
}

/// SQLite 的 BUSY (5) 与 LOCKED (6) 及其扩展码（如 517 BUSY_SNAPSHOT）
/// 表示写锁竞争，稍后重放即可
pub(crate) fn is_lock_contention(code: Option<&str>) -> bool {
    code.and_then(|c| c.parse::<i32>().ok())
        .is_some_and(|c| matches!(c & 0xff, 5 | 6))
}
