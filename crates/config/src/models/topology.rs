use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

use branchdb_domain::{Branch, BranchId, PartitionEndpoint, PartitionId};
use branchdb_errors::BranchResult;

use crate::validation::{ensure, is_supported_url, ConfigValidator};

/// 分区配置：partition id -> 连接串
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionConfig {
    pub url: String,
    /// 保存凭据的环境变量名
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential_ref: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchConfig {
    pub name: String,
    pub partition: String,
}

pub(crate) fn validate_topology(
    partitions: &BTreeMap<String, PartitionConfig>,
    branches: &BTreeMap<String, BranchConfig>,
) -> BranchResult<()> {
    ensure(!partitions.is_empty(), || "至少需要配置一个分区".to_string())?;
    ensure(!branches.is_empty(), || "至少需要配置一个分支".to_string())?;

    for (id, partition) in partitions {
        ensure(!id.trim().is_empty(), || "分区编号不能为空".to_string())?;
        partition.validate().map_err(|e| {
            branchdb_errors::BranchError::config_error(format!("分区 {id}: {e}"))
        })?;
    }

    let mut seen = HashSet::new();
    for (id, branch) in branches {
        let normalized = BranchId::new(id);
        ensure(!normalized.is_empty(), || "分支编号不能为空".to_string())?;
        ensure(seen.insert(normalized.clone()), || {
            format!("分支编号重复: {normalized}")
        })?;
        ensure(!branch.name.trim().is_empty(), || {
            format!("分支 {normalized} 缺少名称")
        })?;
        ensure(partitions.contains_key(branch.partition.trim()), || {
            format!(
                "分支 {normalized} 引用了不存在的分区 {}",
                branch.partition
            )
        })?;
    }
    Ok(())
}

impl ConfigValidator for PartitionConfig {
    fn validate(&self) -> BranchResult<()> {
        ensure(is_supported_url(self.url.trim()), || {
            format!("不支持的连接串: {}", self.url)
        })?;
        if let Some(credential) = &self.credential_ref {
            ensure(!credential.trim().is_empty(), || {
                "credential_ref 不能为空字符串".to_string()
            })?;
        }
        Ok(())
    }
}

pub(crate) fn to_endpoints(partitions: &BTreeMap<String, PartitionConfig>) -> Vec<PartitionEndpoint> {
    partitions
        .iter()
        .map(|(id, p)| PartitionEndpoint {
            id: PartitionId::new(id),
            url: p.url.trim().to_string(),
            credential_ref: p.credential_ref.clone(),
        })
        .collect()
}

pub(crate) fn to_branches(branches: &BTreeMap<String, BranchConfig>) -> Vec<Branch> {
    branches
        .iter()
        .map(|(id, b)| Branch {
            id: BranchId::new(id),
            name: b.name.trim().to_string(),
            partition: PartitionId::new(&b.partition),
        })
        .collect()
}
