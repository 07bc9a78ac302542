use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use serde::Serialize;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, warn};

use branchdb_config::AggregatorConfig;
use branchdb_domain::{
    merge_order, Collection, Document, DocumentFilter, Entity, PartitionEndpoint, PartitionId,
};
use branchdb_errors::{BranchError, BranchResult};
use branchdb_infrastructure::observability::{record_fan_out, record_partial_read};
use branchdb_infrastructure::SessionManager;

use crate::registry::PartitionRegistry;

/// 没有返回结果的分区及原因
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PartitionFailure {
    pub partition: PartitionId,
    pub reason: String,
}

/// 跨分区查询结果：各分区已排序的结果 + 不可用分区列表
#[derive(Debug, Clone)]
pub struct AggregatedResult {
    pub collection: Collection,
    partitions: Vec<(PartitionId, Vec<Document>)>,
    pub unavailable: Vec<PartitionFailure>,
    limit: Option<usize>,
}

impl AggregatedResult {
    pub fn is_complete(&self) -> bool {
        self.unavailable.is_empty()
    }

    pub fn responded(&self) -> impl Iterator<Item = &PartitionId> {
        self.partitions.iter().map(|(id, _)| id)
    }

    /// 惰性 k 路归并
    pub fn iter(&self) -> MergedIter<'_> {
        MergedIter::new(
            self.partitions.iter().map(|(_, docs)| docs.as_slice()).collect(),
            self.limit,
        )
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.iter().next().is_none()
    }

    pub fn documents(&self) -> Vec<Document> {
        self.iter().cloned().collect()
    }

    pub fn entities<T: Entity>(&self) -> BranchResult<Vec<T>> {
        self.iter().map(T::from_document).collect()
    }
}

/// 带不可用标记的类型化结果
#[derive(Debug, Clone, Serialize)]
pub struct PartialResult<T> {
    pub items: Vec<T>,
    pub unavailable: Vec<PartitionFailure>,
}

impl<T> PartialResult<T> {
    pub fn is_complete(&self) -> bool {
        self.unavailable.is_empty()
    }
}

struct HeapEntry<'a> {
    document: &'a Document,
    source: usize,
    position: usize,
}

impl PartialEq for HeapEntry<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapEntry<'_> {}

impl PartialOrd for HeapEntry<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry<'_> {
    // BinaryHeap 是大顶堆，反转比较得到最小元素优先
    fn cmp(&self, other: &Self) -> Ordering {
        merge_order(other.document, self.document).then_with(|| other.source.cmp(&self.source))
    }
}

pub struct MergedIter<'a> {
    sources: Vec<&'a [Document]>,
    heap: BinaryHeap<HeapEntry<'a>>,
    remaining: Option<usize>,
}

impl<'a> MergedIter<'a> {
    fn new(sources: Vec<&'a [Document]>, limit: Option<usize>) -> Self {
        let heap = sources
            .iter()
            .enumerate()
            .filter_map(|(source, docs)| {
                docs.first().map(|document| HeapEntry {
                    document,
                    source,
                    position: 0,
                })
            })
            .collect();
        Self {
            sources,
            heap,
            remaining: limit,
        }
    }
}

impl<'a> Iterator for MergedIter<'a> {
    type Item = &'a Document;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == Some(0) {
            return None;
        }
        let entry = self.heap.pop()?;
        let next_position = entry.position + 1;
        if let Some(document) = self.sources[entry.source].get(next_position) {
            self.heap.push(HeapEntry {
                document,
                source: entry.source,
                position: next_position,
            });
        }
        if let Some(remaining) = self.remaining.as_mut() {
            *remaining -= 1;
        }
        Some(entry.document)
    }
}

/// 合并多个已排序的分区结果
pub fn merge_sorted(sources: &[Vec<Document>]) -> Vec<Document> {
    MergedIter::new(sources.iter().map(Vec::as_slice).collect(), None)
        .cloned()
        .collect()
}

/// 跨分区读取聚合器
pub struct ReadAggregator {
    registry: Arc<PartitionRegistry>,
    sessions: Arc<SessionManager>,
    config: AggregatorConfig,
}

impl ReadAggregator {
    pub fn new(
        registry: Arc<PartitionRegistry>,
        sessions: Arc<SessionManager>,
        config: AggregatorConfig,
    ) -> Self {
        Self {
            registry,
            sessions,
            config,
        }
    }

    /// 向相关分区并发发出同一查询。单个分区的失败或超时记录在结果中，不会让整个查询失败。
    pub async fn query(
        &self,
        collection: Collection,
        filter: &DocumentFilter,
        deadline: Option<Duration>,
    ) -> BranchResult<AggregatedResult> {
        let targets: Vec<PartitionEndpoint> = if filter.branches.is_empty() {
            self.registry.all_partitions()
        } else {
            self.registry.partitions_for(&filter.branches)?
        };
        if targets.is_empty() {
            return Err(BranchError::config_error("没有可查询的分区"));
        }

        let started = Instant::now();
        let deadline_at = deadline
            .or_else(|| self.config.default_deadline())
            .map(|d| started + d);
        let concurrency = self.config.max_concurrency.unwrap_or(targets.len()).max(1);

        let responses: Vec<(PartitionId, BranchResult<Vec<Document>>)> = stream::iter(targets)
            .map(|endpoint| async move {
                let result = self.fetch(&endpoint.id, collection, filter, deadline_at).await;
                (endpoint.id, result)
            })
            .buffer_unordered(concurrency)
            .collect()
            .await;

        let mut partitions = Vec::new();
        let mut unavailable = Vec::new();
        for (partition, result) in responses {
            match result {
                Ok(documents) => partitions.push((partition, documents)),
                Err(e) => {
                    warn!("分区 {} 查询 {} 失败，返回部分结果: {}", partition, collection, e);
                    record_partial_read(partition.as_str());
                    unavailable.push(PartitionFailure {
                        partition,
                        reason: e.to_string(),
                    });
                }
            }
        }
        partitions.sort_by(|a, b| a.0.cmp(&b.0));
        unavailable.sort_by(|a, b| a.partition.cmp(&b.partition));

        let elapsed = started.elapsed();
        record_fan_out(collection.as_str(), elapsed);
        debug!(
            "查询 {} 完成: {} 个分区响应, {} 个不可用, 耗时 {}ms",
            collection,
            partitions.len(),
            unavailable.len(),
            elapsed.as_millis()
        );

        Ok(AggregatedResult {
            collection,
            partitions,
            unavailable,
            limit: filter.limit,
        })
    }

    async fn fetch(
        &self,
        partition: &PartitionId,
        collection: Collection,
        filter: &DocumentFilter,
        deadline_at: Option<Instant>,
    ) -> BranchResult<Vec<Document>> {
        let store = self.sessions.handle(partition)?;
        let query = store.find(collection, filter);
        match deadline_at {
            Some(at) => timeout_at(at, query).await.map_err(|_| {
                BranchError::Timeout(format!("分区 {partition} 未在截止时间前返回"))
            })?,
            None => query.await,
        }
    }

    pub async fn query_entities<T: Entity>(
        &self,
        filter: &DocumentFilter,
        deadline: Option<Duration>,
    ) -> BranchResult<PartialResult<T>> {
        let result = self.query(T::COLLECTION, filter, deadline).await?;
        Ok(PartialResult {
            items: result.entities()?,
            unavailable: result.unavailable,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use branchdb_domain::BranchId;
    use chrono::{DateTime, Utc};
    use serde_json::json;

    fn doc(branch: &str, seq: i64, second: i64) -> Document {
        Document {
            collection: Collection::PurchaseOrder,
            key: format!("{branch}-{seq}"),
            branch: BranchId::new(branch),
            created_at: DateTime::<Utc>::from_timestamp(1_700_000_000 + second, 0).unwrap(),
            seq,
            version: 1,
            body: json!({}),
        }
    }

    fn sources() -> Vec<Vec<Document>> {
        vec![
            vec![doc("CN1", 1, 0), doc("CN1", 2, 5), doc("CN1", 3, 5)],
            vec![doc("CN2", 1, 5), doc("CN2", 2, 7)],
            vec![],
            vec![doc("CN3", 9, 1)],
        ]
    }

    #[test]
    fn test_merge_orders_by_time_then_branch_then_seq() {
        let merged = merge_sorted(&sources());
        let keys: Vec<_> = merged.iter().map(|d| d.key.as_str()).collect();
        assert_eq!(keys, vec!["CN1-1", "CN3-9", "CN1-2", "CN1-3", "CN2-1", "CN2-2"]);
    }

    #[test]
    fn test_merge_is_stable_across_runs() {
        let first = merge_sorted(&sources());
        for _ in 0..10 {
            assert_eq!(merge_sorted(&sources()), first);
        }
        let mut reversed = sources();
        reversed.reverse();
        assert_eq!(merge_sorted(&reversed), first);
    }

    #[test]
    fn test_merged_iter_is_lazy_and_limited() {
        let sources = sources();
        let slices: Vec<&[Document]> = sources.iter().map(Vec::as_slice).collect();
        let mut iter = MergedIter::new(slices, Some(2));
        assert_eq!(iter.next().unwrap().key, "CN1-1");
        assert_eq!(iter.next().unwrap().key, "CN3-9");
        assert!(iter.next().is_none());
    }
}
