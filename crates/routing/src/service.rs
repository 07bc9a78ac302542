use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::info;
use uuid::Uuid;

use branchdb_config::AppConfig;
use branchdb_domain::{
    stock_key, ApplyOutcome, BranchId, Collection, DocumentFilter, Entity, ExportSlip,
    IdempotencyToken, ImportSlip, Item, PartitionEndpoint, PartitionId, PurchaseOrder, StockLevel,
    StoreConnector, TokenPhase, TransactionOutcome, TransactionRecord, Warehouse,
};
use branchdb_errors::{BranchError, BranchResult};
use branchdb_infrastructure::{PartitionHealth, SessionManager};

use crate::aggregator::{AggregatedResult, PartialResult, ReadAggregator};
use crate::coordinator::{ReconciliationReport, TransactionCoordinator};
use crate::registry::PartitionRegistry;
use crate::reports::{self, InventoryReport, RevenueReport};
use crate::router::{EntityRouter, Operation};
use crate::txn_log::{DocumentTransactionLog, InMemoryTransactionLog, TransactionLog};

/// 写操作结果
#[derive(Debug, Clone, PartialEq)]
pub enum OperationResult {
    /// 单分区原子批次
    Local {
        partition: PartitionId,
        outcome: ApplyOutcome,
    },
    /// 跨分区事务，已提交
    Distributed(TransactionOutcome),
}

impl OperationResult {
    pub fn txn_id(&self) -> Option<Uuid> {
        match self {
            OperationResult::Local { .. } => None,
            OperationResult::Distributed(outcome) => Some(outcome.txn_id),
        }
    }
}

/// 业务入口：把路由器、协调器和聚合器组合在一起
pub struct BranchService {
    registry: Arc<PartitionRegistry>,
    sessions: Arc<SessionManager>,
    router: EntityRouter,
    coordinator: TransactionCoordinator,
    aggregator: ReadAggregator,
}

impl BranchService {
    pub fn new(
        registry: Arc<PartitionRegistry>,
        sessions: Arc<SessionManager>,
        log: Arc<dyn TransactionLog>,
        config: &AppConfig,
    ) -> BranchResult<Self> {
        sessions.sync_endpoints(&registry.all_partitions())?;
        Ok(Self {
            router: EntityRouter::new(registry.clone(), sessions.clone()),
            coordinator: TransactionCoordinator::new(
                sessions.clone(),
                log,
                config.coordinator.clone(),
            ),
            aggregator: ReadAggregator::new(
                registry.clone(),
                sessions.clone(),
                config.aggregator.clone(),
            ),
            registry,
            sessions,
        })
    }

    /// 按配置组装全部组件。配置了 coordinator.log_url 时事务记录持久化到该存储，否则保存在内存中。
    pub fn from_config(config: &AppConfig, connector: Arc<dyn StoreConnector>) -> BranchResult<Self> {
        let registry = Arc::new(PartitionRegistry::from_config(config)?);
        let log: Arc<dyn TransactionLog> = match &config.coordinator.log_url {
            Some(url) => {
                let store = connector.connect(&PartitionEndpoint::new("coordinator", url.as_str()))?;
                info!("事务记录保存在 {}", url);
                Arc::new(DocumentTransactionLog::new(store))
            }
            None => Arc::new(InMemoryTransactionLog::new()),
        };
        let sessions = Arc::new(SessionManager::new(connector, config.session.clone()));
        Self::new(registry, sessions, log, config)
    }

    pub fn registry(&self) -> &Arc<PartitionRegistry> {
        &self.registry
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn router(&self) -> &EntityRouter {
        &self.router
    }

    pub fn coordinator(&self) -> &TransactionCoordinator {
        &self.coordinator
    }

    pub fn aggregator(&self) -> &ReadAggregator {
        &self.aggregator
    }

    /// 路由并执行写操作。跨分区操作的失败只在补偿结束后返回：
    /// 补偿成功返回 TransactionAborted，补偿失败返回 CompensationFailed。
    ///
    /// 传入 txn_id 时，重复调用不会重复生效。
    pub async fn execute(
        &self,
        operation: Operation,
        txn_id: Option<Uuid>,
    ) -> BranchResult<OperationResult> {
        let routed = self.router.route(&operation)?;
        if routed.is_cross_partition() {
            let txn_id = txn_id.unwrap_or_else(Uuid::new_v4);
            let outcome = self.coordinator.execute(txn_id, routed).await?.into_result()?;
            return Ok(OperationResult::Distributed(outcome));
        }

        let token = txn_id
            .map(|id| IdempotencyToken::for_step(id, 0, TokenPhase::Apply))
            .unwrap_or_else(IdempotencyToken::random);
        let partition = routed
            .steps
            .first()
            .map(|s| s.endpoint.id.clone())
            .ok_or_else(|| BranchError::Internal(format!("操作 {} 没有目标分区", routed.label)))?;
        let outcome = self.router.execute_local(&routed, &token).await?;
        Ok(OperationResult::Local { partition, outcome })
    }

    pub async fn create_warehouse(&self, warehouse: Warehouse) -> BranchResult<OperationResult> {
        self.execute(Operation::CreateWarehouse(warehouse), None).await
    }

    pub async fn register_item(&self, item: Item) -> BranchResult<OperationResult> {
        self.execute(Operation::RegisterItem(item), None).await
    }

    pub async fn place_purchase_order(
        &self,
        order: PurchaseOrder,
        txn_id: Option<Uuid>,
    ) -> BranchResult<OperationResult> {
        self.execute(Operation::PlacePurchaseOrder(order), txn_id).await
    }

    pub async fn create_export_slip(
        &self,
        slip: ExportSlip,
        txn_id: Option<Uuid>,
    ) -> BranchResult<OperationResult> {
        self.execute(Operation::CreateExportSlip(slip), txn_id).await
    }

    pub async fn create_import_slip(&self, slip: ImportSlip) -> BranchResult<OperationResult> {
        self.execute(Operation::CreateImportSlip(slip), None).await
    }

    pub async fn adjust_stock(
        &self,
        branch: BranchId,
        warehouse: &str,
        item: &str,
        delta: i64,
    ) -> BranchResult<OperationResult> {
        self.execute(
            Operation::AdjustStock {
                branch,
                warehouse: warehouse.to_string(),
                item: item.to_string(),
                delta,
            },
            None,
        )
        .await
    }

    /// 在分支所属分区上按主键读取实体
    pub async fn get<T: Entity>(&self, branch: &BranchId, key: &str) -> BranchResult<Option<T>> {
        let endpoint = self.registry.resolve(branch)?;
        let store = self.sessions.handle(&endpoint.id)?;
        match store.get(T::COLLECTION, key).await? {
            // 多个分支共享一个分区时，只返回属于该分支的文档
            Some(doc) if &doc.branch == branch => T::from_document(&doc).map(Some),
            _ => Ok(None),
        }
    }

    pub async fn get_warehouse(&self, branch: &BranchId, code: &str) -> BranchResult<Option<Warehouse>> {
        self.get(branch, code).await
    }

    pub async fn get_item(&self, branch: &BranchId, code: &str) -> BranchResult<Option<Item>> {
        self.get(branch, code).await
    }

    pub async fn get_purchase_order(
        &self,
        branch: &BranchId,
        id: &str,
    ) -> BranchResult<Option<PurchaseOrder>> {
        self.get(branch, id).await
    }

    pub async fn get_export_slip(&self, branch: &BranchId, id: &str) -> BranchResult<Option<ExportSlip>> {
        self.get(branch, id).await
    }

    pub async fn get_import_slip(&self, branch: &BranchId, id: &str) -> BranchResult<Option<ImportSlip>> {
        self.get(branch, id).await
    }

    /// 当前库存，没有库存行时为 0
    pub async fn stock_level(&self, branch: &BranchId, warehouse: &str, item: &str) -> BranchResult<i64> {
        Ok(self
            .get::<StockLevel>(branch, &stock_key(warehouse, item))
            .await?
            .map(|level| level.quantity)
            .unwrap_or(0))
    }

    pub async fn query(
        &self,
        collection: Collection,
        filter: &DocumentFilter,
        deadline: Option<Duration>,
    ) -> BranchResult<AggregatedResult> {
        self.aggregator.query(collection, filter, deadline).await
    }

    pub async fn list<T: Entity>(
        &self,
        filter: &DocumentFilter,
        deadline: Option<Duration>,
    ) -> BranchResult<PartialResult<T>> {
        self.aggregator.query_entities(filter, deadline).await
    }

    pub async fn revenue_by_branch(
        &self,
        filter: &DocumentFilter,
        deadline: Option<Duration>,
    ) -> BranchResult<RevenueReport> {
        reports::revenue_by_branch(&self.aggregator, filter, deadline).await
    }

    pub async fn inventory_by_branch(
        &self,
        filter: &DocumentFilter,
        deadline: Option<Duration>,
    ) -> BranchResult<InventoryReport> {
        reports::inventory_by_branch(&self.aggregator, filter, deadline).await
    }

    pub async fn transaction(&self, txn_id: Uuid) -> BranchResult<Option<TransactionRecord>> {
        self.coordinator.log().get(txn_id).await
    }

    pub async fn retry_compensation(&self, txn_id: Uuid) -> BranchResult<TransactionOutcome> {
        self.coordinator.retry_compensation(txn_id).await
    }

    pub async fn reconciliation_report(&self, now: DateTime<Utc>) -> BranchResult<ReconciliationReport> {
        self.coordinator.reconciliation_report(now).await
    }

    pub async fn recover_in_flight(&self) -> BranchResult<Vec<TransactionOutcome>> {
        self.coordinator.recover_in_flight().await
    }

    pub async fn purge_expired(&self, now: DateTime<Utc>) -> BranchResult<usize> {
        self.coordinator.purge_expired(now).await
    }

    /// 用新配置替换拓扑，并为新增分区建立连接
    pub fn reload_topology(&self, config: &AppConfig) -> BranchResult<u64> {
        let version = self.registry.reload_from_config(config)?;
        self.sessions.sync_endpoints(&self.registry.all_partitions())?;
        Ok(version)
    }

    pub fn health_report(&self) -> BranchResult<Vec<(PartitionId, PartitionHealth)>> {
        self.sessions.health_report()
    }
}
