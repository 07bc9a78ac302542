//! 测试数据构造器，字段带有合理的默认值

use chrono::{DateTime, Utc};

use branchdb_domain::{
    BranchId, ExportSlip, ImportSlip, OrderLine, OrderRef, OrderStatus, PurchaseOrder, Warehouse,
    WarehouseRef,
};

pub fn warehouse(branch: &str, code: &str) -> Warehouse {
    Warehouse::new(code, &format!("Kho {code}"), "TP.HCM", BranchId::new(branch))
}

pub struct PurchaseOrderBuilder {
    order: PurchaseOrder,
}

impl PurchaseOrderBuilder {
    /// 默认：CN1 向 CN2 的 KHO2 订购 1 台 VT01
    pub fn new(id: &str) -> Self {
        Self {
            order: PurchaseOrder {
                id: id.to_string(),
                branch: BranchId::new("CN1"),
                warehouse: WarehouseRef {
                    branch: BranchId::new("CN2"),
                    code: "KHO2".to_string(),
                },
                supplier: "Apple".to_string(),
                employee: "NV01".to_string(),
                lines: vec![OrderLine::new("VT01", 1, 20_000_000)],
                status: OrderStatus::Placed,
                fulfilled_by: None,
                created_at: Utc::now(),
            },
        }
    }

    pub fn with_branch(mut self, branch: &str) -> Self {
        self.order.branch = BranchId::new(branch);
        self
    }

    pub fn with_warehouse(mut self, branch: &str, code: &str) -> Self {
        self.order.warehouse = WarehouseRef {
            branch: BranchId::new(branch),
            code: code.to_string(),
        };
        self
    }

    pub fn with_lines(mut self, lines: Vec<OrderLine>) -> Self {
        self.order.lines = lines;
        self
    }

    pub fn with_line(mut self, item: &str, quantity: i64, unit_price: i64) -> Self {
        self.order.lines = vec![OrderLine::new(item, quantity, unit_price)];
        self
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.order.created_at = created_at;
        self
    }

    pub fn build(self) -> PurchaseOrder {
        self.order
    }
}

pub struct ExportSlipBuilder {
    slip: ExportSlip,
}

impl ExportSlipBuilder {
    /// 默认：CN1 从 KHO1 出库 1 台 VT01，不关联订单
    pub fn new(id: &str) -> Self {
        Self {
            slip: ExportSlip {
                id: id.to_string(),
                branch: BranchId::new("CN1"),
                warehouse: "KHO1".to_string(),
                customer: "Nguyễn Văn A".to_string(),
                employee: "NV01".to_string(),
                lines: vec![OrderLine::new("VT01", 1, 25_000_000)],
                origin: None,
                created_at: Utc::now(),
            },
        }
    }

    pub fn with_branch(mut self, branch: &str, warehouse: &str) -> Self {
        self.slip.branch = BranchId::new(branch);
        self.slip.warehouse = warehouse.to_string();
        self
    }

    pub fn with_line(mut self, item: &str, quantity: i64, unit_price: i64) -> Self {
        self.slip.lines = vec![OrderLine::new(item, quantity, unit_price)];
        self
    }

    pub fn fulfilling(mut self, order_branch: &str, order_id: &str) -> Self {
        self.slip.origin = Some(OrderRef {
            branch: BranchId::new(order_branch),
            id: order_id.to_string(),
        });
        self
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.slip.created_at = created_at;
        self
    }

    pub fn build(self) -> ExportSlip {
        self.slip
    }
}

pub struct ImportSlipBuilder {
    slip: ImportSlip,
}

impl ImportSlipBuilder {
    pub fn new(id: &str) -> Self {
        Self {
            slip: ImportSlip {
                id: id.to_string(),
                branch: BranchId::new("CN1"),
                warehouse: "KHO1".to_string(),
                employee: "NV01".to_string(),
                order_id: None,
                lines: vec![OrderLine::new("VT01", 10, 18_000_000)],
                created_at: Utc::now(),
            },
        }
    }

    pub fn with_branch(mut self, branch: &str, warehouse: &str) -> Self {
        self.slip.branch = BranchId::new(branch);
        self.slip.warehouse = warehouse.to_string();
        self
    }

    pub fn with_line(mut self, item: &str, quantity: i64, unit_price: i64) -> Self {
        self.slip.lines = vec![OrderLine::new(item, quantity, unit_price)];
        self
    }

    pub fn for_order(mut self, order_id: &str) -> Self {
        self.slip.order_id = Some(order_id.to_string());
        self
    }

    pub fn build(self) -> ImportSlip {
        self.slip
    }
}
