//! 分支分区路由与跨分支一致性
//!
//! 注册表决定每个分支的数据位于哪个分区；路由器把业务操作拆成各分区的子操作；
//! 协调器顺序执行跨分区子操作并在失败时补偿；聚合器负责跨分区读取。

pub mod aggregator;
pub mod coordinator;
pub mod registry;
pub mod reports;
pub mod retry;
pub mod router;
pub mod seed;
pub mod service;
pub mod txn_log;

pub use aggregator::{AggregatedResult, PartialResult, PartitionFailure, ReadAggregator};
pub use coordinator::{ReconciliationReport, TransactionCoordinator};
pub use registry::{PartitionRegistry, RegistrySnapshot};
pub use reports::{BranchRevenue, InventoryReport, RevenueReport};
pub use router::{EntityRouter, Operation, RoutedOperation, RoutedStep};
pub use seed::{seed_demo_data, SeedReport};
pub use service::{BranchService, OperationResult};
pub use txn_log::{DocumentTransactionLog, InMemoryTransactionLog, TransactionLog};
