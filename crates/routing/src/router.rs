use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::{debug, info};

use branchdb_domain::{
    validate_lines, ApplyOutcome, BranchId, Collection, Entity, ExportSlip, FieldExpectation,
    IdempotencyToken, ImportSlip, Item, Mutation, OrderLine, OrderStatus, PartitionEndpoint,
    PartitionId, PurchaseOrder, StepRole, SubOperation, Warehouse, MAX_QUANTITY,
};
use branchdb_errors::{BranchError, BranchResult};
use branchdb_infrastructure::SessionManager;

use crate::registry::{PartitionRegistry, RegistrySnapshot};

/// 可路由的业务操作
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    CreateWarehouse(Warehouse),
    RegisterItem(Item),
    AdjustStock {
        branch: BranchId,
        warehouse: String,
        item: String,
        delta: i64,
    },
    PlacePurchaseOrder(PurchaseOrder),
    CreateExportSlip(ExportSlip),
    CreateImportSlip(ImportSlip),
}

impl Operation {
    pub fn label(&self) -> &'static str {
        match self {
            Operation::CreateWarehouse(_) => "create-warehouse",
            Operation::RegisterItem(_) => "register-item",
            Operation::AdjustStock { .. } => "adjust-stock",
            Operation::PlacePurchaseOrder(_) => "place-purchase-order",
            Operation::CreateExportSlip(_) => "create-export-slip",
            Operation::CreateImportSlip(_) => "create-import-slip",
        }
    }

    /// 发起写入的分支
    pub fn owner(&self) -> &BranchId {
        match self {
            Operation::CreateWarehouse(w) => &w.branch,
            Operation::RegisterItem(i) => &i.branch,
            Operation::AdjustStock { branch, .. } => branch,
            Operation::PlacePurchaseOrder(o) => &o.branch,
            Operation::CreateExportSlip(s) => &s.branch,
            Operation::CreateImportSlip(s) => &s.branch,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RoutedStep {
    pub endpoint: PartitionEndpoint,
    pub operation: SubOperation,
}

/// 路由结果：一个或多个 (分区, 子操作)，写入方分区在前，依赖分区按编号排序
#[derive(Debug, Clone, PartialEq)]
pub struct RoutedOperation {
    pub label: &'static str,
    pub origin: BranchId,
    pub registry_version: u64,
    pub steps: Vec<RoutedStep>,
}

impl RoutedOperation {
    pub fn is_cross_partition(&self) -> bool {
        self.steps.len() > 1
    }

    pub fn partitions(&self) -> Vec<PartitionId> {
        self.steps.iter().map(|s| s.endpoint.id.clone()).collect()
    }
}

/// 某个分区上累积的写入与逆操作
struct PlannedStep {
    branch: BranchId,
    endpoint: PartitionEndpoint,
    description: String,
    apply: Vec<Mutation>,
    undo: Vec<Mutation>,
}

impl PlannedStep {
    fn new(branch: &BranchId, endpoint: PartitionEndpoint, description: &str) -> Self {
        Self {
            branch: branch.clone(),
            endpoint,
            description: description.to_string(),
            apply: Vec::new(),
            undo: Vec::new(),
        }
    }

    /// 逆操作按相反顺序执行，后加入的写入先撤销
    fn push(&mut self, apply: Vec<Mutation>, undo: Vec<Mutation>) {
        self.apply.extend(apply);
        let earlier = std::mem::replace(&mut self.undo, undo);
        self.undo.extend(earlier);
    }

    fn into_sub_operation(self, role: StepRole, keep_undo: bool) -> RoutedStep {
        RoutedStep {
            operation: SubOperation::new(
                role,
                self.branch,
                self.endpoint.id.clone(),
                self.description,
                self.apply,
                if keep_undo { self.undo } else { Vec::new() },
            ),
            endpoint: self.endpoint,
        }
    }
}

/// 路由计划：与写入方同分区的依赖写入并入主批次
struct PlanBuilder<'a> {
    snapshot: &'a RegistrySnapshot,
    primary: PlannedStep,
    dependents: BTreeMap<PartitionId, PlannedStep>,
}

impl<'a> PlanBuilder<'a> {
    fn new(snapshot: &'a RegistrySnapshot, owner: &BranchId, description: &str) -> BranchResult<Self> {
        let endpoint = snapshot.resolve(owner)?.clone();
        Ok(Self {
            snapshot,
            primary: PlannedStep::new(owner, endpoint, description),
            dependents: BTreeMap::new(),
        })
    }

    fn primary(&mut self, apply: Vec<Mutation>, undo: Vec<Mutation>) {
        self.primary.push(apply, undo);
    }

    fn dependent(
        &mut self,
        branch: &BranchId,
        description: &str,
        apply: Vec<Mutation>,
        undo: Vec<Mutation>,
    ) -> BranchResult<()> {
        let endpoint = self.snapshot.resolve(branch)?.clone();
        if endpoint.id == self.primary.endpoint.id {
            self.primary.push(apply, undo);
            return Ok(());
        }
        self.dependents
            .entry(endpoint.id.clone())
            .or_insert_with(|| PlannedStep::new(branch, endpoint, description))
            .push(apply, undo);
        Ok(())
    }

    fn finish(self, label: &'static str, origin: BranchId) -> RoutedOperation {
        let registry_version = self.snapshot.version();
        // 单分区操作依赖存储原子性，不需要逆操作
        let cross = !self.dependents.is_empty();
        let mut steps = vec![self.primary.into_sub_operation(StepRole::Primary, cross)];
        steps.extend(
            self.dependents
                .into_values()
                .map(|step| step.into_sub_operation(StepRole::Dependent, true)),
        );
        for (index, step) in steps.iter_mut().enumerate() {
            step.operation.index = index;
        }
        RoutedOperation {
            label,
            origin,
            registry_version,
            steps,
        }
    }
}

fn require_non_empty(field: &str, value: &str) -> BranchResult<()> {
    if value.trim().is_empty() {
        return Err(BranchError::validation_error(format!("{field} 不能为空")));
    }
    Ok(())
}

fn stock_changes(branch: &BranchId, warehouse: &str, lines: &[OrderLine], sign: i64) -> Vec<Mutation> {
    lines
        .iter()
        .map(|line| Mutation::AdjustStock {
            branch: branch.clone(),
            warehouse: warehouse.to_string(),
            item: line.item.clone(),
            delta: sign * line.quantity,
        })
        .collect()
}

/// 明细中的商品必须已在目录中登记
fn require_items(lines: &[OrderLine]) -> Vec<Mutation> {
    lines
        .iter()
        .map(|line| Mutation::Require {
            collection: Collection::Item,
            key: line.item.clone(),
            expect: None,
        })
        .collect()
}

/// 仓库必须存在且属于指定分支
fn require_warehouse(branch: &BranchId, code: &str) -> Mutation {
    Mutation::Require {
        collection: Collection::Warehouse,
        key: code.to_string(),
        expect: Some(FieldExpectation::new("branch", branch.as_str())),
    }
}

fn order_patch(order_id: &str, status: OrderStatus, fulfilled_by: Value) -> Mutation {
    let mut fields = Map::new();
    fields.insert("status".to_string(), Value::from(status.as_str()));
    fields.insert("fulfilled_by".to_string(), fulfilled_by);
    Mutation::Patch {
        collection: Collection::PurchaseOrder,
        key: order_id.to_string(),
        fields,
    }
}

/// 实体路由器：根据实体声明的归属与引用决定目标分区
pub struct EntityRouter {
    registry: Arc<PartitionRegistry>,
    sessions: Arc<SessionManager>,
}

impl EntityRouter {
    pub fn new(registry: Arc<PartitionRegistry>, sessions: Arc<SessionManager>) -> Self {
        Self { registry, sessions }
    }

    pub fn registry(&self) -> &Arc<PartitionRegistry> {
        &self.registry
    }

    pub fn route(&self, operation: &Operation) -> BranchResult<RoutedOperation> {
        let snapshot = self.registry.snapshot();
        let label = operation.label();
        let origin = operation.owner().clone();

        let plan = match operation {
            Operation::CreateWarehouse(warehouse) => {
                require_non_empty("仓库编号", &warehouse.code)?;
                require_non_empty("仓库名称", &warehouse.name)?;
                let mut plan = PlanBuilder::new(&snapshot, &warehouse.branch, "insert warehouse")?;
                plan.primary(
                    vec![Mutation::Insert {
                        document: warehouse.to_document()?,
                    }],
                    Vec::new(),
                );
                plan
            }
            Operation::RegisterItem(item) => {
                require_non_empty("商品编号", &item.code)?;
                require_non_empty("商品名称", &item.name)?;
                let mut plan = PlanBuilder::new(&snapshot, &item.branch, "register item")?;
                plan.primary(
                    vec![Mutation::Insert {
                        document: item.to_document()?,
                    }],
                    Vec::new(),
                );
                plan
            }
            Operation::AdjustStock {
                branch,
                warehouse,
                item,
                delta,
            } => {
                require_non_empty("仓库编号", warehouse)?;
                require_non_empty("商品编号", item)?;
                if *delta == 0 {
                    return Err(BranchError::validation_error("库存调整数量不能为0"));
                }
                if !(-MAX_QUANTITY..=MAX_QUANTITY).contains(delta) {
                    return Err(BranchError::validation_error(format!(
                        "库存调整数量必须在 ±{MAX_QUANTITY} 之内"
                    )));
                }
                let mut plan = PlanBuilder::new(&snapshot, branch, "adjust stock")?;
                plan.primary(
                    vec![
                        require_warehouse(branch, warehouse),
                        Mutation::AdjustStock {
                            branch: branch.clone(),
                            warehouse: warehouse.clone(),
                            item: item.clone(),
                            delta: *delta,
                        },
                        Mutation::Require {
                            collection: Collection::Item,
                            key: item.clone(),
                            expect: None,
                        },
                    ],
                    Vec::new(),
                );
                plan
            }
            Operation::PlacePurchaseOrder(order) => self.plan_purchase_order(&snapshot, order)?,
            Operation::CreateExportSlip(slip) => self.plan_export_slip(&snapshot, slip)?,
            Operation::CreateImportSlip(slip) => {
                require_non_empty("入库单号", &slip.id)?;
                require_non_empty("员工", &slip.employee)?;
                validate_lines(&slip.id, &slip.lines)?;
                let mut plan = PlanBuilder::new(&snapshot, &slip.branch, "insert import slip")?;
                let mut apply = vec![
                    require_warehouse(&slip.branch, &slip.warehouse),
                    Mutation::Insert {
                        document: slip.to_document()?,
                    },
                ];
                apply.extend(stock_changes(&slip.branch, &slip.warehouse, &slip.lines, 1));
                apply.extend(require_items(&slip.lines));
                plan.primary(apply, Vec::new());
                plan
            }
        };

        let routed = plan.finish(label, origin);
        debug!(
            "操作 {} 路由到分区 {:?}",
            routed.label,
            routed.partitions()
        );
        Ok(routed)
    }

    fn plan_purchase_order<'a>(
        &self,
        snapshot: &'a RegistrySnapshot,
        order: &PurchaseOrder,
    ) -> BranchResult<PlanBuilder<'a>> {
        require_non_empty("订单号", &order.id)?;
        require_non_empty("供应商", &order.supplier)?;
        require_non_empty("员工", &order.employee)?;
        require_non_empty("仓库编号", &order.warehouse.code)?;
        validate_lines(&order.id, &order.lines)?;
        if order.status != OrderStatus::Placed || order.fulfilled_by.is_some() {
            return Err(BranchError::validation_error(format!(
                "新订单 {} 的状态必须为 placed",
                order.id
            )));
        }

        let mut plan = PlanBuilder::new(snapshot, &order.branch, "insert purchase order")?;
        plan.primary(
            vec![Mutation::Insert {
                document: order.to_document()?,
            }],
            vec![Mutation::patch(
                Collection::PurchaseOrder,
                &order.id,
                "status",
                OrderStatus::Failed.as_str(),
            )],
        );

        for reference in order.foreign_refs() {
            let mut apply = vec![require_warehouse(&reference.branch, &reference.key)];
            apply.extend(stock_changes(&reference.branch, &reference.key, &order.lines, -1));
            apply.extend(require_items(&order.lines));
            let undo = stock_changes(&reference.branch, &reference.key, &order.lines, 1);
            plan.dependent(&reference.branch, "reserve warehouse stock", apply, undo)?;
        }
        Ok(plan)
    }

    fn plan_export_slip<'a>(
        &self,
        snapshot: &'a RegistrySnapshot,
        slip: &ExportSlip,
    ) -> BranchResult<PlanBuilder<'a>> {
        require_non_empty("出库单号", &slip.id)?;
        require_non_empty("客户", &slip.customer)?;
        require_non_empty("员工", &slip.employee)?;
        validate_lines(&slip.id, &slip.lines)?;

        let mut plan = PlanBuilder::new(snapshot, &slip.branch, "insert export slip")?;
        let mut apply = vec![
            require_warehouse(&slip.branch, &slip.warehouse),
            Mutation::Insert {
                document: slip.to_document()?,
            },
        ];
        apply.extend(stock_changes(&slip.branch, &slip.warehouse, &slip.lines, -1));
        apply.extend(require_items(&slip.lines));
        let mut undo = vec![Mutation::Delete {
            collection: Collection::ExportSlip,
            key: slip.id.clone(),
        }];
        undo.extend(stock_changes(&slip.branch, &slip.warehouse, &slip.lines, 1));
        plan.primary(apply, undo);

        let fulfilled_by = serde_json::json!({ "branch": slip.branch, "id": slip.id });
        for reference in slip.foreign_refs() {
            let apply = vec![
                Mutation::Require {
                    collection: Collection::PurchaseOrder,
                    key: reference.key.clone(),
                    expect: Some(FieldExpectation::new("status", OrderStatus::Placed.as_str())),
                },
                order_patch(&reference.key, OrderStatus::Fulfilled, fulfilled_by.clone()),
            ];
            let undo = vec![order_patch(&reference.key, OrderStatus::Placed, Value::Null)];
            plan.dependent(&reference.branch, "mark order fulfilled", apply, undo)?;
        }
        Ok(plan)
    }

    /// 执行单分区操作：一次原子批次，同步返回结果
    pub async fn execute_local(
        &self,
        routed: &RoutedOperation,
        token: &IdempotencyToken,
    ) -> BranchResult<ApplyOutcome> {
        let step = match routed.steps.as_slice() {
            [step] => step,
            _ => {
                return Err(BranchError::Internal(format!(
                    "操作 {} 跨越 {} 个分区，不能作为本地操作执行",
                    routed.label,
                    routed.steps.len()
                )))
            }
        };
        let store = self.sessions.handle(&step.endpoint.id)?;
        let outcome = store.apply(token, &step.operation.apply).await?;
        info!(
            "本地操作 {} 在分区 {} 完成 ({:?})",
            routed.label, step.endpoint.id, outcome
        );
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use branchdb_config::SessionConfig;
    use branchdb_domain::{Branch, OrderRef, WarehouseRef};
    use branchdb_infrastructure::DefaultConnector;
    use chrono::Utc;

    fn router(shared_partition: bool) -> EntityRouter {
        let cn2_partition = if shared_partition { "p1" } else { "p2" };
        let registry = PartitionRegistry::new(
            vec![
                Branch {
                    id: BranchId::new("CN1"),
                    name: "Chi nhánh 1".to_string(),
                    partition: PartitionId::new("p1"),
                },
                Branch {
                    id: BranchId::new("CN2"),
                    name: "Chi nhánh 2".to_string(),
                    partition: PartitionId::new(cn2_partition),
                },
            ],
            vec![
                PartitionEndpoint::new("p1", "memory://router-p1"),
                PartitionEndpoint::new("p2", "memory://router-p2"),
            ],
        )
        .unwrap();
        let sessions = SessionManager::new(Arc::new(DefaultConnector::new()), SessionConfig::default());
        EntityRouter::new(Arc::new(registry), Arc::new(sessions))
    }

    fn order(branch: &str, warehouse_branch: &str) -> PurchaseOrder {
        PurchaseOrder {
            id: "DH01".to_string(),
            branch: BranchId::new(branch),
            warehouse: WarehouseRef {
                branch: BranchId::new(warehouse_branch),
                code: "KHO2".to_string(),
            },
            supplier: "Apple".to_string(),
            employee: "NV01".to_string(),
            lines: vec![OrderLine::new("VT01", 3, 100)],
            status: OrderStatus::Placed,
            fulfilled_by: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_cross_partition_order_has_primary_then_dependent() {
        let routed = router(false)
            .route(&Operation::PlacePurchaseOrder(order("CN1", "CN2")))
            .unwrap();
        assert!(routed.is_cross_partition());
        assert_eq!(routed.partitions(), vec![PartitionId::new("p1"), PartitionId::new("p2")]);

        let primary = &routed.steps[0].operation;
        assert_eq!(primary.role, StepRole::Primary);
        assert!(matches!(primary.apply[0], Mutation::Insert { .. }));
        assert_eq!(primary.undo.len(), 1);

        let dependent = &routed.steps[1].operation;
        assert_eq!(dependent.index, 1);
        assert_eq!(dependent.branch, BranchId::new("CN2"));
        assert!(matches!(
            dependent.apply[1],
            Mutation::AdjustStock { delta: -3, .. }
        ));
        assert!(matches!(dependent.undo[0], Mutation::AdjustStock { delta: 3, .. }));
    }

    #[test]
    fn test_branches_sharing_partition_route_locally() {
        let routed = router(true)
            .route(&Operation::PlacePurchaseOrder(order("CN1", "CN2")))
            .unwrap();
        assert!(!routed.is_cross_partition());
        let step = &routed.steps[0].operation;
        // 订单插入 + 仓库检查 + 库存扣减 + 商品检查
        assert_eq!(step.apply.len(), 4);
        assert!(matches!(
            step.apply.last(),
            Some(Mutation::Require {
                collection: Collection::Item,
                ..
            })
        ));
        assert!(step.undo.is_empty());
    }

    #[test]
    fn test_unknown_branch_and_invalid_input() {
        let router = router(false);
        let err = router
            .route(&Operation::PlacePurchaseOrder(order("CN1", "CN9")))
            .unwrap_err();
        assert!(matches!(err, BranchError::UnknownBranch { .. }));

        let mut empty = order("CN1", "CN2");
        empty.lines.clear();
        assert!(matches!(
            router.route(&Operation::PlacePurchaseOrder(empty)).unwrap_err(),
            BranchError::Validation(_)
        ));

        let mut fulfilled = order("CN1", "CN2");
        fulfilled.status = OrderStatus::Fulfilled;
        assert!(router.route(&Operation::PlacePurchaseOrder(fulfilled)).is_err());
    }

    #[test]
    fn test_export_slip_with_remote_origin() {
        let slip = ExportSlip {
            id: "PX01".to_string(),
            branch: BranchId::new("CN2"),
            warehouse: "KHO2".to_string(),
            customer: "Nguyễn Văn A".to_string(),
            employee: "NV02".to_string(),
            lines: vec![OrderLine::new("VT02", 1, 500)],
            origin: Some(OrderRef {
                branch: BranchId::new("CN1"),
                id: "DH01".to_string(),
            }),
            created_at: Utc::now(),
        };
        let routed = router(false)
            .route(&Operation::CreateExportSlip(slip.clone()))
            .unwrap();
        assert_eq!(routed.partitions(), vec![PartitionId::new("p2"), PartitionId::new("p1")]);
        assert_eq!(routed.steps[0].operation.undo.len(), 2);

        let mut local = slip;
        local.origin = None;
        let routed = router(false)
            .route(&Operation::CreateExportSlip(local))
            .unwrap();
        assert!(!routed.is_cross_partition());
    }

    #[test]
    fn test_adjust_stock_rejects_zero_delta() {
        let err = router(false)
            .route(&Operation::AdjustStock {
                branch: BranchId::new("CN1"),
                warehouse: "KHO1".to_string(),
                item: "VT01".to_string(),
                delta: 0,
            })
            .unwrap_err();
        assert!(matches!(err, BranchError::Validation(_)));
    }
}
