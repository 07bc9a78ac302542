use serde::Serialize;
use tracing::{info, warn};

use branchdb_domain::{ApplyOutcome, BranchId, IdempotencyToken, Item, Warehouse};
use branchdb_errors::{BranchError, BranchResult};

use crate::router::{EntityRouter, Operation};

/// 演示商品目录：(编号, 名称)
pub const CATALOG: &[(&str, &str)] = &[
    ("VT01", "iPhone 15"),
    ("VT02", "Samsung S23"),
    ("VT03", "Oppo Reno10"),
];

/// 演示仓库：(分支, 仓库编号, 名称, 地址)
pub const WAREHOUSES: &[(&str, &str, &str, &str)] = &[
    ("CN1", "KHO1", "Kho Chi nhánh 1", "Quận 1, TP.HCM"),
    ("CN2", "KHO2", "Kho Chi nhánh 2", "Quận 9, TP.HCM"),
];

pub const INITIAL_QUANTITY: i64 = 100;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SeedReport {
    pub applied: usize,
    /// 已存在（令牌重复或主键已存在）的写入
    pub skipped: usize,
    /// 注册表中不存在的分支
    pub missing_branches: Vec<BranchId>,
}

/// 写入演示数据：商品目录、仓库和初始库存。
/// 每个写入使用固定令牌，重复执行不会重复加库存。
pub async fn seed_demo_data(router: &EntityRouter) -> BranchResult<SeedReport> {
    let mut report = SeedReport::default();

    for (branch, code, name, address) in WAREHOUSES {
        let branch = BranchId::new(branch);
        if router.registry().branch(&branch).is_err() {
            warn!("分支 {} 不在注册表中，跳过演示数据", branch);
            report.missing_branches.push(branch);
            continue;
        }

        let warehouse = Warehouse::new(code, name, address, branch.clone());
        let token = IdempotencyToken::new(format!("seed/{branch}/{code}"));
        record(
            &mut report,
            apply(router, Operation::CreateWarehouse(warehouse), &token).await,
        )?;

        for (item, item_name) in CATALOG {
            let token = IdempotencyToken::new(format!("seed/{branch}/item/{item}"));
            let catalog_entry = Item::new(item, item_name, branch.clone());
            record(
                &mut report,
                apply(router, Operation::RegisterItem(catalog_entry), &token).await,
            )?;
        }

        for (item, _) in CATALOG {
            let token = IdempotencyToken::new(format!("seed/{branch}/{code}/{item}"));
            let operation = Operation::AdjustStock {
                branch: branch.clone(),
                warehouse: code.to_string(),
                item: item.to_string(),
                delta: INITIAL_QUANTITY,
            };
            record(&mut report, apply(router, operation, &token).await)?;
        }
    }

    info!(
        "演示数据写入完成: 新写入 {}, 已存在 {}",
        report.applied, report.skipped
    );
    Ok(report)
}

async fn apply(
    router: &EntityRouter,
    operation: Operation,
    token: &IdempotencyToken,
) -> BranchResult<ApplyOutcome> {
    let routed = router.route(&operation)?;
    router.execute_local(&routed, token).await
}

fn record(report: &mut SeedReport, result: BranchResult<ApplyOutcome>) -> BranchResult<()> {
    match result {
        Ok(ApplyOutcome::Applied) => report.applied += 1,
        Ok(ApplyOutcome::Duplicate) | Err(BranchError::DuplicateKey { .. }) => report.skipped += 1,
        Err(e) => return Err(e),
    }
    Ok(())
}
