use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 分支编号（如 CN1），统一转换为大写
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct BranchId(String);

impl BranchId {
    pub fn new(raw: impl AsRef<str>) -> Self {
        Self(raw.as_ref().trim().to_uppercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<String> for BranchId {
    fn from(raw: String) -> Self {
        Self::new(raw)
    }
}

impl From<&str> for BranchId {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

impl From<BranchId> for String {
    fn from(id: BranchId) -> Self {
        id.0
    }
}

impl fmt::Display for BranchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 分区（独立存储实例）编号
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct PartitionId(String);

impl PartitionId {
    pub fn new(raw: impl AsRef<str>) -> Self {
        Self(raw.as_ref().trim().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for PartitionId {
    fn from(raw: String) -> Self {
        Self::new(raw)
    }
}

impl From<&str> for PartitionId {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

impl From<PartitionId> for String {
    fn from(id: PartitionId) -> Self {
        id.0
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 集合名称，沿用原系统的表名
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Collection {
    #[serde(rename = "Kho")]
    Warehouse,
    #[serde(rename = "Vattu")]
    Item,
    #[serde(rename = "Inventory")]
    Inventory,
    #[serde(rename = "DatHang")]
    PurchaseOrder,
    #[serde(rename = "PhieuXuat")]
    ExportSlip,
    #[serde(rename = "PhieuNhap")]
    ImportSlip,
    #[serde(rename = "CrossBranchTxn")]
    Transaction,
}

impl Collection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Collection::Warehouse => "Kho",
            Collection::Item => "Vattu",
            Collection::Inventory => "Inventory",
            Collection::PurchaseOrder => "DatHang",
            Collection::ExportSlip => "PhieuXuat",
            Collection::ImportSlip => "PhieuNhap",
            Collection::Transaction => "CrossBranchTxn",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "Kho" => Some(Collection::Warehouse),
            "Vattu" => Some(Collection::Item),
            "Inventory" => Some(Collection::Inventory),
            "DatHang" => Some(Collection::PurchaseOrder),
            "PhieuXuat" => Some(Collection::ExportSlip),
            "PhieuNhap" => Some(Collection::ImportSlip),
            "CrossBranchTxn" => Some(Collection::Transaction),
            _ => None,
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 跨分支引用：被引用实体所属分支 + 集合 + 主键
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BranchRef {
    pub branch: BranchId,
    pub collection: Collection,
    pub key: String,
}

impl BranchRef {
    pub fn new(branch: BranchId, collection: Collection, key: impl Into<String>) -> Self {
        Self {
            branch,
            collection,
            key: key.into(),
        }
    }
}

/// 子操作所处阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenPhase {
    Apply,
    Undo,
}

/// 幂等令牌：同一分区上重复提交相同令牌不会产生额外效果
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyToken(String);

impl IdempotencyToken {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// 本地操作使用随机令牌
    pub fn random() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn for_step(txn_id: Uuid, index: usize, phase: TokenPhase) -> Self {
        let suffix = match phase {
            TokenPhase::Apply => "apply",
            TokenPhase::Undo => "undo",
        };
        Self(format!("{txn_id}/{index}/{suffix}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdempotencyToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
