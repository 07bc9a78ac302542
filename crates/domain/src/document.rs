use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value};

use branchdb_errors::{BranchError, BranchResult};

use crate::value_objects::{BranchId, Collection};

/// 存储在分区上的文档
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub collection: Collection,
    pub key: String,
    pub branch: BranchId,
    pub created_at: DateTime<Utc>,
    /// 分区内单调递增的本地序号，由存储分配
    pub seq: i64,
    pub version: i64,
    pub body: Value,
}

impl Document {
    pub fn new(
        collection: Collection,
        key: String,
        branch: BranchId,
        created_at: DateTime<Utc>,
        body: Value,
    ) -> Self {
        Self {
            collection,
            key,
            branch,
            created_at,
            seq: 0,
            version: 0,
            body,
        }
    }

    pub fn decode<T: DeserializeOwned>(&self) -> BranchResult<T> {
        serde_json::from_value(self.body.clone()).map_err(|e| {
            BranchError::Serialization(format!(
                "解码文档 {}/{} 失败: {e}",
                self.collection, self.key
            ))
        })
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.body.get(name)
    }
}

/// 全局合并顺序：创建时间，其次 (分支, 本地序号)
pub fn merge_order(a: &Document, b: &Document) -> Ordering {
    a.created_at
        .cmp(&b.created_at)
        .then_with(|| a.branch.cmp(&b.branch))
        .then_with(|| a.seq.cmp(&b.seq))
}

/// 查询条件：分支、创建时间区间 [from, until)、顶层字段相等、数量上限
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DocumentFilter {
    pub branches: Vec<BranchId>,
    pub created_from: Option<DateTime<Utc>>,
    pub created_until: Option<DateTime<Utc>>,
    pub field_equals: Vec<(String, Value)>,
    pub limit: Option<usize>,
}

impl DocumentFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn branch(mut self, branch: BranchId) -> Self {
        self.branches.push(branch);
        self
    }

    pub fn created_from(mut self, from: DateTime<Utc>) -> Self {
        self.created_from = Some(from);
        self
    }

    pub fn created_until(mut self, until: DateTime<Utc>) -> Self {
        self.created_until = Some(until);
        self
    }

    pub fn field_eq(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.field_equals.push((field.to_string(), value.into()));
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, document: &Document) -> bool {
        if !self.branches.is_empty() && !self.branches.contains(&document.branch) {
            return false;
        }
        if let Some(from) = self.created_from {
            if document.created_at < from {
                return false;
            }
        }
        if let Some(until) = self.created_until {
            if document.created_at >= until {
                return false;
            }
        }
        self.field_equals
            .iter()
            .all(|(field, expected)| document.body.get(field) == Some(expected))
    }
}

/// 字段期望值，用于前置条件检查
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldExpectation {
    pub field: String,
    pub value: Value,
}

impl FieldExpectation {
    pub fn new(field: &str, value: impl Into<Value>) -> Self {
        Self {
            field: field.to_string(),
            value: value.into(),
        }
    }

    pub fn check(&self, document: &Document) -> BranchResult<()> {
        match document.body.get(&self.field) {
            Some(actual) if *actual == self.value => Ok(()),
            actual => Err(BranchError::PreconditionFailed(format!(
                "{}/{} 字段 {} 期望 {}，实际 {}",
                document.collection,
                document.key,
                self.field,
                self.value,
                actual.cloned().unwrap_or(Value::Null)
            ))),
        }
    }
}

/// 单个分区上的原子写操作。一批 Mutation 在同一分区内要么全部生效，要么全部不生效。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Mutation {
    /// 插入新文档，主键已存在时报 DuplicateKey
    Insert { document: Document },
    Upsert { document: Document },
    /// 删除文档，不存在时为空操作
    Delete { collection: Collection, key: String },
    /// 合并顶层字段
    Patch {
        collection: Collection,
        key: String,
        fields: Map<String, Value>,
    },
    /// 前置条件：文档必须存在（并可选地满足字段期望）
    Require {
        collection: Collection,
        key: String,
        expect: Option<FieldExpectation>,
    },
    /// 库存增减，结果不能为负；不存在的库存行按 0 处理
    AdjustStock {
        branch: BranchId,
        warehouse: String,
        item: String,
        delta: i64,
    },
}

impl Mutation {
    pub fn describe(&self) -> String {
        match self {
            Mutation::Insert { document } => format!("insert {}/{}", document.collection, document.key),
            Mutation::Upsert { document } => format!("upsert {}/{}", document.collection, document.key),
            Mutation::Delete { collection, key } => format!("delete {collection}/{key}"),
            Mutation::Patch { collection, key, .. } => format!("patch {collection}/{key}"),
            Mutation::Require { collection, key, .. } => format!("require {collection}/{key}"),
            Mutation::AdjustStock {
                warehouse,
                item,
                delta,
                ..
            } => format!("adjust {warehouse}/{item} {delta:+}"),
        }
    }

    pub fn patch(collection: Collection, key: &str, field: &str, value: impl Into<Value>) -> Self {
        let mut fields = Map::new();
        fields.insert(field.to_string(), value.into());
        Mutation::Patch {
            collection,
            key: key.to_string(),
            fields,
        }
    }
}

/// 把补丁字段合并进文档主体
pub fn apply_patch(document: &mut Document, fields: &Map<String, Value>) -> BranchResult<()> {
    let body = document.body.as_object_mut().ok_or_else(|| {
        BranchError::Internal(format!(
            "文档 {}/{} 主体不是对象，无法合并字段",
            document.collection, document.key
        ))
    })?;
    for (field, value) in fields {
        body.insert(field.clone(), value.clone());
    }
    document.version += 1;
    Ok(())
}

/// 计算库存调整后的数量，不足时返回 InsufficientStock
pub fn adjusted_quantity(
    warehouse: &str,
    item: &str,
    current: i64,
    delta: i64,
) -> BranchResult<i64> {
    let next = current.checked_add(delta).ok_or_else(|| {
        BranchError::validation_error(format!(
            "仓库 {warehouse} 商品 {item} 库存调整 {delta} 超出范围"
        ))
    })?;
    if next < 0 {
        return Err(BranchError::InsufficientStock {
            warehouse: warehouse.to_string(),
            item: item.to_string(),
            requested: delta.checked_neg().unwrap_or(i64::MAX),
            available: current,
        });
    }
    Ok(next)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// 令牌已经应用过，本次提交没有任何效果
    Duplicate,
}
