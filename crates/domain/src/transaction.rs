use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use branchdb_errors::{BranchError, BranchResult};

use crate::document::{Document, Mutation};
use crate::value_objects::{BranchId, Collection, IdempotencyToken, PartitionId, TokenPhase};

/// 跨分支事务状态机
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TxnState {
    Initiated,
    InProgress,
    Committed,
    Compensating,
    Compensated,
    Failed,
}

impl TxnState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TxnState::Initiated => "INITIATED",
            TxnState::InProgress => "IN_PROGRESS",
            TxnState::Committed => "COMMITTED",
            TxnState::Compensating => "COMPENSATING",
            TxnState::Compensated => "COMPENSATED",
            TxnState::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TxnState::Committed | TxnState::Compensated | TxnState::Failed
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubOpStatus {
    Pending,
    Committed,
    Failed,
    Compensated,
}

/// 写入主记录的分区是 Primary，需要同步反映关系的分区是 Dependent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepRole {
    Primary,
    Dependent,
}

/// 子操作：一个分区上的一批原子写入及其逆操作
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubOperation {
    pub index: usize,
    pub role: StepRole,
    pub branch: BranchId,
    pub partition: PartitionId,
    pub description: String,
    pub apply: Vec<Mutation>,
    pub undo: Vec<Mutation>,
    pub status: SubOpStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    /// 最后一次尝试超时，写入可能已经生效
    #[serde(default)]
    pub outcome_unknown: bool,
    pub completed_at: Option<DateTime<Utc>>,
}

impl SubOperation {
    pub fn new(
        role: StepRole,
        branch: BranchId,
        partition: PartitionId,
        description: impl Into<String>,
        apply: Vec<Mutation>,
        undo: Vec<Mutation>,
    ) -> Self {
        Self {
            index: 0,
            role,
            branch,
            partition,
            description: description.into(),
            apply,
            undo,
            status: SubOpStatus::Pending,
            attempts: 0,
            last_error: None,
            outcome_unknown: false,
            completed_at: None,
        }
    }

    pub fn token(&self, txn_id: Uuid, phase: TokenPhase) -> IdempotencyToken {
        IdempotencyToken::for_step(txn_id, self.index, phase)
    }
}

/// 跨分支事务记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub id: Uuid,
    pub label: String,
    pub origin: BranchId,
    pub state: TxnState,
    pub steps: Vec<SubOperation>,
    pub failure: Option<String>,
    pub failed_step: Option<usize>,
    pub compensation_error: Option<String>,
    /// 每次持久化后递增，事务日志据此拒绝过期的写入
    #[serde(default)]
    pub revision: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TransactionRecord {
    pub fn new(id: Uuid, label: impl Into<String>, origin: BranchId, steps: Vec<SubOperation>) -> Self {
        let now = Utc::now();
        let steps = steps
            .into_iter()
            .enumerate()
            .map(|(index, mut step)| {
                step.index = index;
                step
            })
            .collect();
        Self {
            id,
            label: label.into(),
            origin,
            state: TxnState::Initiated,
            steps,
            failure: None,
            failed_step: None,
            compensation_error: None,
            revision: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn transition(&mut self, state: TxnState) {
        self.state = state;
        self.updated_at = Utc::now();
    }

    pub fn committed_steps(&self) -> impl Iterator<Item = &SubOperation> {
        self.steps
            .iter()
            .filter(|s| s.status == SubOpStatus::Committed)
    }

    pub fn outcome(&self) -> TransactionOutcome {
        TransactionOutcome {
            txn_id: self.id,
            state: self.state,
            failure: self.failure.clone(),
            failed_step: self.failed_step,
            compensation_error: self.compensation_error.clone(),
        }
    }

    pub fn to_document(&self) -> BranchResult<Document> {
        Ok(Document::new(
            Collection::Transaction,
            self.id.to_string(),
            self.origin.clone(),
            self.created_at,
            serde_json::to_value(self)?,
        ))
    }

    pub fn from_document(document: &Document) -> BranchResult<Self> {
        document.decode()
    }
}

/// 返回给调用方的事务最终结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionOutcome {
    pub txn_id: Uuid,
    pub state: TxnState,
    pub failure: Option<String>,
    pub failed_step: Option<usize>,
    pub compensation_error: Option<String>,
}

impl TransactionOutcome {
    pub fn is_committed(&self) -> bool {
        self.state == TxnState::Committed
    }

    /// 转换为错误分类：COMPENSATED -> TransactionAborted，FAILED -> CompensationFailed
    pub fn into_result(self) -> BranchResult<Self> {
        match self.state {
            TxnState::Committed => Ok(self),
            TxnState::Compensated => Err(BranchError::TransactionAborted {
                txn_id: self.txn_id.to_string(),
                reason: self.failure.unwrap_or_else(|| "未知原因".to_string()),
            }),
            TxnState::Failed => Err(BranchError::CompensationFailed {
                txn_id: self.txn_id.to_string(),
                reason: self
                    .compensation_error
                    .or(self.failure)
                    .unwrap_or_else(|| "未知原因".to_string()),
            }),
            state => Err(BranchError::Internal(format!(
                "事务 {} 尚未结束，当前状态 {}",
                self.txn_id,
                state.as_str()
            ))),
        }
    }
}
