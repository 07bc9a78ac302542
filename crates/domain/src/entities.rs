use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use branchdb_errors::{BranchError, BranchResult};

use crate::document::Document;
use crate::value_objects::{BranchId, BranchRef, Collection, PartitionId};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unreachable,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unreachable => "unreachable",
        }
    }

    pub fn accepts_dispatch(&self) -> bool {
        !matches!(self, HealthStatus::Unreachable)
    }
}

/// 分支：创建后不可变，由管理操作开通
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Branch {
    pub id: BranchId,
    pub name: String,
    pub partition: PartitionId,
}

/// 分区端点描述：连接串 + 凭据引用（环境变量名，不保存密钥本身）
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PartitionEndpoint {
    pub id: PartitionId,
    pub url: String,
    pub credential_ref: Option<String>,
}

impl PartitionEndpoint {
    pub fn new(id: impl Into<PartitionId>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            url: url.into(),
            credential_ref: None,
        }
    }
}

/// 可路由实体：每个实体类型显式声明自己的归属分支与跨分支引用，
/// 路由层只依赖这里的声明，不从无类型的负载字段中推断外键。
pub trait Entity: Serialize + DeserializeOwned + Clone + Send + Sync {
    const COLLECTION: Collection;

    fn key(&self) -> String;

    fn owner(&self) -> &BranchId;

    fn created_at(&self) -> DateTime<Utc>;

    /// 该实体引用的其他实体（可能位于其他分支）
    fn foreign_refs(&self) -> Vec<BranchRef> {
        Vec::new()
    }

    fn to_document(&self) -> BranchResult<Document> {
        Ok(Document::new(
            Self::COLLECTION,
            self.key(),
            self.owner().clone(),
            self.created_at(),
            serde_json::to_value(self)?,
        ))
    }

    fn from_document(document: &Document) -> BranchResult<Self> {
        if document.collection != Self::COLLECTION {
            return Err(BranchError::Internal(format!(
                "集合不匹配: 期望 {}，实际 {}",
                Self::COLLECTION,
                document.collection
            )));
        }
        document.decode()
    }
}

/// 仓库（Kho）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Warehouse {
    pub code: String,
    pub name: String,
    pub address: String,
    pub branch: BranchId,
    pub created_at: DateTime<Utc>,
}

impl Warehouse {
    pub fn new(code: &str, name: &str, address: &str, branch: BranchId) -> Self {
        Self {
            code: code.to_string(),
            name: name.to_string(),
            address: address.to_string(),
            branch,
            created_at: Utc::now(),
        }
    }
}

impl Entity for Warehouse {
    const COLLECTION: Collection = Collection::Warehouse;

    fn key(&self) -> String {
        self.code.clone()
    }

    fn owner(&self) -> &BranchId {
        &self.branch
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

/// 商品目录（Vattu）。目录数据复制到每个分支的分区，
/// 同一分区上的商品编号唯一，库存与单据明细只能引用已登记的商品。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub code: String,
    pub name: String,
    pub branch: BranchId,
    pub created_at: DateTime<Utc>,
}

impl Item {
    pub fn new(code: &str, name: &str, branch: BranchId) -> Self {
        Self {
            code: code.to_string(),
            name: name.to_string(),
            branch,
            created_at: Utc::now(),
        }
    }
}

impl Entity for Item {
    const COLLECTION: Collection = Collection::Item;

    fn key(&self) -> String {
        self.code.clone()
    }

    fn owner(&self) -> &BranchId {
        &self.branch
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

/// 库存：(仓库, 商品) -> 数量
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StockLevel {
    pub warehouse: String,
    pub item: String,
    pub quantity: i64,
    pub branch: BranchId,
    pub created_at: DateTime<Utc>,
}

pub fn stock_key(warehouse: &str, item: &str) -> String {
    format!("{warehouse}/{item}")
}

impl Entity for StockLevel {
    const COLLECTION: Collection = Collection::Inventory;

    fn key(&self) -> String {
        stock_key(&self.warehouse, &self.item)
    }

    fn owner(&self) -> &BranchId {
        &self.branch
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

/// 单据明细行（CTDDH / CTPX / CTPN）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderLine {
    pub item: String,
    pub quantity: i64,
    pub unit_price: i64,
}

/// 单行数量与单次库存调整的上限
pub const MAX_QUANTITY: i64 = 1_000_000_000;
pub const MAX_UNIT_PRICE: i64 = 1_000_000_000_000;

impl OrderLine {
    pub fn new(item: &str, quantity: i64, unit_price: i64) -> Self {
        Self {
            item: item.to_string(),
            quantity,
            unit_price,
        }
    }

    pub fn amount(&self) -> BranchResult<i64> {
        self.quantity.checked_mul(self.unit_price).ok_or_else(|| {
            BranchError::validation_error(format!("商品 {} 金额超出范围", self.item))
        })
    }
}

/// 明细行金额合计
pub fn lines_total(lines: &[OrderLine]) -> BranchResult<i64> {
    lines.iter().try_fold(0i64, |total, line| {
        total
            .checked_add(line.amount()?)
            .ok_or_else(|| BranchError::validation_error("单据金额合计超出范围"))
    })
}

/// 检查明细行：至少一行、数量与单价在允许范围内、金额合计不溢出、同一商品不重复
pub fn validate_lines(document_id: &str, lines: &[OrderLine]) -> BranchResult<()> {
    if lines.is_empty() {
        return Err(BranchError::validation_error(format!(
            "单据 {document_id} 没有明细行"
        )));
    }
    let mut seen = HashSet::new();
    for line in lines {
        if line.item.trim().is_empty() {
            return Err(BranchError::validation_error(format!(
                "单据 {document_id} 存在空商品编号"
            )));
        }
        if line.quantity <= 0 || line.quantity > MAX_QUANTITY {
            return Err(BranchError::validation_error(format!(
                "单据 {document_id} 商品 {} 数量必须在 1..={MAX_QUANTITY} 之间",
                line.item
            )));
        }
        if line.unit_price < 0 || line.unit_price > MAX_UNIT_PRICE {
            return Err(BranchError::validation_error(format!(
                "单据 {document_id} 商品 {} 单价必须在 0..={MAX_UNIT_PRICE} 之间",
                line.item
            )));
        }
        if !seen.insert(line.item.as_str()) {
            return Err(BranchError::validation_error(format!(
                "单据 {document_id} 商品 {} 明细重复",
                line.item
            )));
        }
    }
    lines_total(lines)?;
    Ok(())
}

/// 仓库引用：所属分支 + 仓库编号
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WarehouseRef {
    pub branch: BranchId,
    pub code: String,
}

/// 订单引用：(分支, 订单号)，用于对账时检测重复或缺失
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OrderRef {
    pub branch: BranchId,
    pub id: String,
}

/// 出库单引用
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SlipRef {
    pub branch: BranchId,
    pub id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Placed,
    Failed,
    Fulfilled,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Placed => "placed",
            OrderStatus::Failed => "failed",
            OrderStatus::Fulfilled => "fulfilled",
        }
    }
}

/// 订货单（DatHang）：创建在下单分支的分区上，目标仓库可能属于其他分支
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PurchaseOrder {
    pub id: String,
    pub branch: BranchId,
    pub warehouse: WarehouseRef,
    pub supplier: String,
    pub employee: String,
    pub lines: Vec<OrderLine>,
    pub status: OrderStatus,
    pub fulfilled_by: Option<SlipRef>,
    pub created_at: DateTime<Utc>,
}

impl PurchaseOrder {
    pub fn total_amount(&self) -> BranchResult<i64> {
        lines_total(&self.lines)
    }

    pub fn order_ref(&self) -> OrderRef {
        OrderRef {
            branch: self.branch.clone(),
            id: self.id.clone(),
        }
    }
}

impl Entity for PurchaseOrder {
    const COLLECTION: Collection = Collection::PurchaseOrder;

    fn key(&self) -> String {
        self.id.clone()
    }

    fn owner(&self) -> &BranchId {
        &self.branch
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn foreign_refs(&self) -> Vec<BranchRef> {
        vec![BranchRef::new(
            self.warehouse.branch.clone(),
            Collection::Warehouse,
            self.warehouse.code.clone(),
        )]
    }
}

/// 出库单（PhieuXuat）：创建在履约分支的分区上，回指原始订单
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportSlip {
    pub id: String,
    pub branch: BranchId,
    pub warehouse: String,
    pub customer: String,
    pub employee: String,
    pub lines: Vec<OrderLine>,
    pub origin: Option<OrderRef>,
    pub created_at: DateTime<Utc>,
}

impl Entity for ExportSlip {
    const COLLECTION: Collection = Collection::ExportSlip;

    fn key(&self) -> String {
        self.id.clone()
    }

    fn owner(&self) -> &BranchId {
        &self.branch
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn foreign_refs(&self) -> Vec<BranchRef> {
        self.origin
            .iter()
            .map(|o| BranchRef::new(o.branch.clone(), Collection::PurchaseOrder, o.id.clone()))
            .collect()
    }
}

/// 入库单（PhieuNhap）：只在本分支分区内增加库存
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportSlip {
    pub id: String,
    pub branch: BranchId,
    pub warehouse: String,
    pub employee: String,
    /// 原系统中的 MasoDDH 字段，仅作记录
    pub order_id: Option<String>,
    pub lines: Vec<OrderLine>,
    pub created_at: DateTime<Utc>,
}

impl Entity for ImportSlip {
    const COLLECTION: Collection = Collection::ImportSlip;

    fn key(&self) -> String {
        self.id.clone()
    }

    fn owner(&self) -> &BranchId {
        &self.branch
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order(branch: &str, warehouse_branch: &str) -> PurchaseOrder {
        PurchaseOrder {
            id: "DH001".to_string(),
            branch: BranchId::new(branch),
            warehouse: WarehouseRef {
                branch: BranchId::new(warehouse_branch),
                code: "KHO2".to_string(),
            },
            supplier: "NCC".to_string(),
            employee: "NV01".to_string(),
            lines: vec![OrderLine::new("VT01", 2, 1000), OrderLine::new("VT02", 1, 500)],
            status: OrderStatus::Placed,
            fulfilled_by: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_purchase_order_declares_warehouse_reference() {
        let order = order("CN1", "CN2");
        let refs = order.foreign_refs();
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].branch, BranchId::new("CN2"));
        assert_eq!(refs[0].collection, Collection::Warehouse);
        assert_eq!(refs[0].key, "KHO2");
        assert_eq!(order.total_amount().unwrap(), 2500);
    }

    #[test]
    fn test_export_slip_without_origin_has_no_references() {
        let slip = ExportSlip {
            id: "PX001".to_string(),
            branch: BranchId::new("CN1"),
            warehouse: "KHO1".to_string(),
            customer: "A".to_string(),
            employee: "NV01".to_string(),
            lines: vec![OrderLine::new("VT01", 1, 1)],
            origin: None,
            created_at: Utc::now(),
        };
        assert!(slip.foreign_refs().is_empty());
    }

    #[test]
    fn test_document_round_trip_keeps_identity() {
        let order = order("cn1", "cn2");
        let doc = order.to_document().unwrap();
        assert_eq!(doc.collection, Collection::PurchaseOrder);
        assert_eq!(doc.key, "DH001");
        assert_eq!(doc.branch.as_str(), "CN1");

        let decoded = PurchaseOrder::from_document(&doc).unwrap();
        assert_eq!(decoded, order);
        assert!(Warehouse::from_document(&doc).is_err());
    }

    #[test]
    fn test_validate_lines() {
        assert!(validate_lines("DH1", &[OrderLine::new("VT01", 1, 0)]).is_ok());
        assert!(validate_lines("DH1", &[]).is_err());
        assert!(validate_lines("DH1", &[OrderLine::new("VT01", 0, 1)]).is_err());
        assert!(validate_lines("DH1", &[OrderLine::new("VT01", 1, -1)]).is_err());
        assert!(validate_lines(
            "DH1",
            &[OrderLine::new("VT02", 5, 1), OrderLine::new("VT02", 1, 1)]
        )
        .is_err());
    }

    #[test]
    fn test_validate_lines_rejects_out_of_range_amounts() {
        let huge = OrderLine::new("VT01", i64::MAX, 2);
        assert!(matches!(
            validate_lines("DH1", &[huge.clone()]).unwrap_err(),
            BranchError::Validation(_)
        ));
        assert!(huge.amount().is_err());
        assert!(validate_lines("DH1", &[OrderLine::new("VT01", 1, i64::MAX)]).is_err());

        // 单行在上限内，但数量乘单价溢出
        let line = OrderLine::new("VT01", MAX_QUANTITY, MAX_UNIT_PRICE);
        assert!(validate_lines("DH1", &[line]).is_err());

        let lines = [OrderLine::new("VT01", 2, 500), OrderLine::new("VT02", 3, 100)];
        assert_eq!(lines_total(&lines).unwrap(), 1300);
    }
}
