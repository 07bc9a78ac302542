//! 测试拓扑与通用等待工具

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::sleep;

use branchdb_config::{AppConfig, BranchConfig, PartitionConfig};
use branchdb_domain::{BranchId, Item};
use branchdb_errors::{BranchError, BranchResult};
use branchdb_routing::BranchService;

use crate::builders::warehouse;
use crate::mocks::{FaultyStore, StaticConnector};

pub struct TestEnv;

impl TestEnv {
    /// 在超时前轮询条件直到满足
    pub async fn wait_for<F, Fut>(mut condition: F, timeout: Duration) -> bool
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        let start = std::time::Instant::now();
        while start.elapsed() < timeout {
            if condition().await {
                return true;
            }
            sleep(Duration::from_millis(10)).await;
        }
        false
    }

    pub fn unique_name(prefix: &str) -> String {
        let timestamp = Utc::now().timestamp_nanos_opt().unwrap_or(0);
        format!("{prefix}_{timestamp}")
    }
}

/// 三分支三分区测试拓扑：CN1→p1, CN2→p2, CN3→p3。
/// 每个分区是包装了内存存储的 FaultyStore，可以单独注入故障。
pub struct TestNetwork {
    pub config: AppConfig,
    pub connector: Arc<StaticConnector>,
    pub service: BranchService,
    stores: BTreeMap<String, Arc<FaultyStore>>,
}

impl TestNetwork {
    pub fn new() -> Self {
        Self::with_config(Self::fast_config(&[("CN1", "p1"), ("CN2", "p2"), ("CN3", "p3")]))
    }

    /// 重试与超时都缩短到毫秒级的配置
    pub fn fast_config(topology: &[(&str, &str)]) -> AppConfig {
        let mut config = AppConfig::default();
        config.partitions.clear();
        config.branches.clear();
        for (branch, partition) in topology {
            config
                .partitions
                .entry(partition.to_string())
                .or_insert_with(|| PartitionConfig {
                    url: format!("memory://{partition}"),
                    credential_ref: None,
                });
            config.branches.insert(
                branch.to_string(),
                BranchConfig {
                    name: format!("Chi nhánh {branch}"),
                    partition: partition.to_string(),
                },
            );
        }
        config.coordinator.max_retries = 2;
        config.coordinator.sub_operation_timeout_ms = 200;
        config.coordinator.retry_base_delay_ms = 1;
        config.coordinator.retry_max_delay_ms = 5;
        config.session.probe_timeout_ms = 100;
        config
    }

    pub fn with_config(config: AppConfig) -> Self {
        let connector = Arc::new(StaticConnector::new());
        let mut stores = BTreeMap::new();
        for (id, partition) in &config.partitions {
            let store = Arc::new(FaultyStore::in_memory(id));
            connector.register(&partition.url, store.clone());
            stores.insert(id.clone(), store);
        }
        let service = BranchService::from_config(&config, connector.clone())
            .expect("测试拓扑应当有效");
        Self {
            config,
            connector,
            service,
            stores,
        }
    }

    /// 分区对应的故障注入存储
    pub fn store(&self, partition: &str) -> Arc<FaultyStore> {
        self.stores
            .get(partition)
            .cloned()
            .unwrap_or_else(|| panic!("测试拓扑中没有分区 {partition}"))
    }

    /// 分支所在分区的存储
    pub fn branch_store(&self, branch: &str) -> Arc<FaultyStore> {
        let partition = &self.config.branches[branch].partition;
        self.store(partition)
    }

    pub fn branch_ids(&self) -> Vec<String> {
        self.config.branches.keys().cloned().collect()
    }

    /// 在分支目录中登记商品，已登记的跳过
    pub async fn register_items(&self, branch: &str, items: &[&str]) -> BranchResult<()> {
        for item in items {
            match self
                .service
                .register_item(Item::new(item, item, BranchId::new(branch)))
                .await
            {
                Ok(_) | Err(BranchError::DuplicateKey { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// 创建仓库、登记商品并写入初始库存
    pub async fn stock_warehouse(
        &self,
        branch: &str,
        code: &str,
        items: &[(&str, i64)],
    ) -> BranchResult<()> {
        self.service.create_warehouse(warehouse(branch, code)).await?;
        let codes: Vec<&str> = items.iter().map(|(item, _)| *item).collect();
        self.register_items(branch, &codes).await?;
        for (item, quantity) in items {
            self.service
                .adjust_stock(BranchId::new(branch), code, item, *quantity)
                .await?;
        }
        Ok(())
    }

    pub async fn stock(&self, branch: &str, warehouse: &str, item: &str) -> i64 {
        self.service
            .stock_level(&BranchId::new(branch), warehouse, item)
            .await
            .expect("读取库存失败")
    }
}

impl Default for TestNetwork {
    fn default() -> Self {
        Self::new()
    }
}
