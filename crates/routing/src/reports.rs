use std::collections::BTreeMap;
use std::time::Duration;

use serde::Serialize;

use branchdb_domain::{lines_total, BranchId, DocumentFilter, ExportSlip, StockLevel};
use branchdb_errors::{BranchError, BranchResult};

use crate::aggregator::{PartitionFailure, ReadAggregator};

/// 单个分支的销售汇总
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BranchRevenue {
    pub export_slips: u64,
    pub revenue: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RevenueReport {
    pub branches: BTreeMap<BranchId, BranchRevenue>,
    pub unavailable: Vec<PartitionFailure>,
}

#[derive(Debug, Clone, Serialize)]
pub struct InventoryReport {
    /// 分支 -> 库存总量
    pub branches: BTreeMap<BranchId, i64>,
    pub unavailable: Vec<PartitionFailure>,
}

impl RevenueReport {
    pub fn is_complete(&self) -> bool {
        self.unavailable.is_empty()
    }
}

impl InventoryReport {
    pub fn is_complete(&self) -> bool {
        self.unavailable.is_empty()
    }
}

fn overflow(what: &str, branch: &BranchId) -> BranchError {
    BranchError::Internal(format!("分支 {branch} 的{what}合计超出范围"))
}

/// 各分支出库单数量与销售额
pub async fn revenue_by_branch(
    aggregator: &ReadAggregator,
    filter: &DocumentFilter,
    deadline: Option<Duration>,
) -> BranchResult<RevenueReport> {
    let result = aggregator
        .query_entities::<ExportSlip>(filter, deadline)
        .await?;
    let mut branches: BTreeMap<BranchId, BranchRevenue> = BTreeMap::new();
    for slip in result.items {
        let entry = branches.entry(slip.branch.clone()).or_default();
        entry.export_slips += 1;
        entry.revenue = entry
            .revenue
            .checked_add(lines_total(&slip.lines)?)
            .ok_or_else(|| overflow("销售额", &slip.branch))?;
    }
    Ok(RevenueReport {
        branches,
        unavailable: result.unavailable,
    })
}

/// 各分支所有仓库的库存总量
pub async fn inventory_by_branch(
    aggregator: &ReadAggregator,
    filter: &DocumentFilter,
    deadline: Option<Duration>,
) -> BranchResult<InventoryReport> {
    let result = aggregator
        .query_entities::<StockLevel>(filter, deadline)
        .await?;
    let mut branches: BTreeMap<BranchId, i64> = BTreeMap::new();
    for level in result.items {
        let total = branches.entry(level.branch.clone()).or_default();
        *total = total
            .checked_add(level.quantity)
            .ok_or_else(|| overflow("库存总量", &level.branch))?;
    }
    Ok(InventoryReport {
        branches,
        unavailable: result.unavailable,
    })
}
