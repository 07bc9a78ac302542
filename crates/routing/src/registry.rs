use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, RwLock};

use tracing::{info, warn};

use branchdb_config::AppConfig;
use branchdb_domain::{Branch, BranchId, PartitionEndpoint, PartitionId};
use branchdb_errors::{BranchError, BranchResult};

/// 分区注册表的不可变快照
#[derive(Debug, Clone, PartialEq)]
pub struct RegistrySnapshot {
    version: u64,
    branches: BTreeMap<BranchId, Branch>,
    partitions: BTreeMap<PartitionId, PartitionEndpoint>,
}

impl RegistrySnapshot {
    pub fn build(
        version: u64,
        branches: Vec<Branch>,
        endpoints: Vec<PartitionEndpoint>,
    ) -> BranchResult<Self> {
        let mut partitions = BTreeMap::new();
        for endpoint in endpoints {
            if endpoint.id.as_str().is_empty() {
                return Err(BranchError::config_error("分区编号不能为空"));
            }
            if let Some(previous) = partitions.insert(endpoint.id.clone(), endpoint) {
                return Err(BranchError::config_error(format!(
                    "分区 {} 重复定义",
                    previous.id
                )));
            }
        }

        let mut by_id = BTreeMap::new();
        for branch in branches {
            if branch.id.is_empty() {
                return Err(BranchError::config_error("分支编号不能为空"));
            }
            if !partitions.contains_key(&branch.partition) {
                return Err(BranchError::config_error(format!(
                    "分支 {} 引用了不存在的分区 {}",
                    branch.id, branch.partition
                )));
            }
            if by_id.contains_key(&branch.id) {
                return Err(BranchError::config_error(format!(
                    "分支 {} 重复定义",
                    branch.id
                )));
            }
            by_id.insert(branch.id.clone(), branch);
        }

        Ok(Self {
            version,
            branches: by_id,
            partitions,
        })
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn resolve(&self, branch: &BranchId) -> BranchResult<&PartitionEndpoint> {
        let branch = self
            .branches
            .get(branch)
            .ok_or_else(|| BranchError::unknown_branch(branch.as_str()))?;
        self.partitions
            .get(&branch.partition)
            .ok_or_else(|| BranchError::unknown_partition(branch.partition.as_str()))
    }

    pub fn branch(&self, id: &BranchId) -> BranchResult<&Branch> {
        self.branches
            .get(id)
            .ok_or_else(|| BranchError::unknown_branch(id.as_str()))
    }

    pub fn branches(&self) -> impl Iterator<Item = &Branch> {
        self.branches.values()
    }

    pub fn partition(&self, id: &PartitionId) -> BranchResult<&PartitionEndpoint> {
        self.partitions
            .get(id)
            .ok_or_else(|| BranchError::unknown_partition(id.as_str()))
    }

    /// 按分区编号排序
    pub fn all_partitions(&self) -> Vec<PartitionEndpoint> {
        self.partitions.values().cloned().collect()
    }

    /// 给定分支所在的分区（去重、排序）
    pub fn partitions_for(&self, branches: &[BranchId]) -> BranchResult<Vec<PartitionEndpoint>> {
        let mut ids = BTreeSet::new();
        for branch in branches {
            ids.insert(self.resolve(branch)?.id.clone());
        }
        ids.iter()
            .map(|id| self.partition(id).cloned())
            .collect()
    }

    pub fn branches_on(&self, partition: &PartitionId) -> Vec<BranchId> {
        self.branches
            .values()
            .filter(|b| b.partition == *partition)
            .map(|b| b.id.clone())
            .collect()
    }
}

/// 分区注册表：启动时从配置加载，之后只通过显式的管理操作更新。
/// 更新时整体替换快照，读取方不会看到更新到一半的映射。
pub struct PartitionRegistry {
    current: RwLock<Arc<RegistrySnapshot>>,
}

impl PartitionRegistry {
    pub fn new(branches: Vec<Branch>, endpoints: Vec<PartitionEndpoint>) -> BranchResult<Self> {
        let snapshot = RegistrySnapshot::build(1, branches, endpoints)?;
        info!(
            "分区注册表已加载: {} 个分支, {} 个分区",
            snapshot.branches.len(),
            snapshot.partitions.len()
        );
        Ok(Self {
            current: RwLock::new(Arc::new(snapshot)),
        })
    }

    pub fn from_config(config: &AppConfig) -> BranchResult<Self> {
        Self::new(config.branch_list(), config.endpoints())
    }

    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        match self.current.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn version(&self) -> u64 {
        self.snapshot().version()
    }

    pub fn resolve(&self, branch: &BranchId) -> BranchResult<PartitionEndpoint> {
        self.snapshot().resolve(branch).cloned()
    }

    pub fn branch(&self, id: &BranchId) -> BranchResult<Branch> {
        self.snapshot().branch(id).cloned()
    }

    pub fn branches(&self) -> Vec<Branch> {
        self.snapshot().branches().cloned().collect()
    }

    pub fn partition(&self, id: &PartitionId) -> BranchResult<PartitionEndpoint> {
        self.snapshot().partition(id).cloned()
    }

    pub fn all_partitions(&self) -> Vec<PartitionEndpoint> {
        self.snapshot().all_partitions()
    }

    pub fn partitions_for(&self, branches: &[BranchId]) -> BranchResult<Vec<PartitionEndpoint>> {
        self.snapshot().partitions_for(branches)
    }

    /// 新增或更新一个分支（可同时提供新的分区端点）。
    ///
    /// 把已有分支改到另一个分区只改变路由，不迁移数据：该分支留在旧分区上的文档
    /// 之后无法再通过 `resolve` 访问，新的写入从空状态开始落在新分区。需要先在
    /// 旧分区导出数据并导入新分区，再执行重映射。
    pub fn upsert_branch(
        &self,
        branch: Branch,
        endpoint: Option<PartitionEndpoint>,
    ) -> BranchResult<u64> {
        let current = self.snapshot();
        let mut branches: Vec<Branch> = current
            .branches()
            .filter(|b| b.id != branch.id)
            .cloned()
            .collect();
        if let Ok(existing) = current.branch(&branch.id) {
            if existing.partition != branch.partition {
                warn!(
                    "分支 {} 从分区 {} 重映射到 {}，旧分区上的数据不会迁移",
                    branch.id, existing.partition, branch.partition
                );
            }
        }
        branches.push(branch);

        let mut endpoints: Vec<PartitionEndpoint> = current
            .partitions
            .values()
            .filter(|p| endpoint.as_ref().map_or(true, |e| e.id != p.id))
            .cloned()
            .collect();
        endpoints.extend(endpoint);

        self.swap(&current, branches, endpoints)
    }

    /// 用新的拓扑整体替换注册表。删除已存在的分支会被拒绝。
    ///
    /// 与 [`upsert_branch`](Self::upsert_branch) 相同，分支改到其他分区时旧分区上的
    /// 文档不会迁移，重映射后通过路由读取不到。
    pub fn reload(
        &self,
        branches: Vec<Branch>,
        endpoints: Vec<PartitionEndpoint>,
    ) -> BranchResult<u64> {
        let current = self.snapshot();
        let incoming: BTreeSet<&BranchId> = branches.iter().map(|b| &b.id).collect();
        let dropped: Vec<String> = current
            .branches
            .keys()
            .filter(|id| !incoming.contains(id))
            .map(|id| id.to_string())
            .collect();
        if !dropped.is_empty() {
            return Err(BranchError::config_error(format!(
                "分支不能被删除: {}",
                dropped.join(", ")
            )));
        }

        for branch in &branches {
            if let Ok(existing) = current.branch(&branch.id) {
                if existing.partition != branch.partition {
                    warn!(
                        "分支 {} 从分区 {} 重映射到 {}，旧分区上的数据不会迁移",
                        branch.id, existing.partition, branch.partition
                    );
                }
            }
        }

        self.swap(&current, branches, endpoints)
    }

    pub fn reload_from_config(&self, config: &AppConfig) -> BranchResult<u64> {
        self.reload(config.branch_list(), config.endpoints())
    }

    fn swap(
        &self,
        base: &Arc<RegistrySnapshot>,
        branches: Vec<Branch>,
        endpoints: Vec<PartitionEndpoint>,
    ) -> BranchResult<u64> {
        let next = RegistrySnapshot::build(base.version + 1, branches, endpoints)?;
        let mut guard = self
            .current
            .write()
            .map_err(|_| BranchError::Internal("注册表锁已损坏".to_string()))?;
        if guard.version != base.version {
            return Err(BranchError::PreconditionFailed(format!(
                "注册表已被并发更新 (期望版本 {}，当前版本 {})",
                base.version, guard.version
            )));
        }
        let version = next.version;
        *guard = Arc::new(next);
        info!("分区注册表已更新到版本 {}", version);
        Ok(version)
    }
}
