//! 测试替身：可注入故障的存储包装器与固定连接器

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use branchdb_domain::{
    ApplyOutcome, Collection, Document, DocumentFilter, DocumentStore, IdempotencyToken, Mutation,
    PartitionEndpoint, StoreConnector,
};
use branchdb_errors::{BranchError, BranchResult};
use branchdb_infrastructure::InMemoryStore;

#[derive(Debug, Default)]
struct FaultState {
    down: bool,
    fail_applies: u32,
    lost_responses: u32,
    reject_undo: bool,
    read_latency: Option<Duration>,
    apply_latency: Option<Duration>,
    apply_calls: u32,
    ping_calls: u32,
}

/// 包装一个真实存储，按需注入故障：
///
/// - `set_down`: 所有调用返回 PartitionUnavailable
/// - `fail_next_applies`: 接下来 n 次写入在到达存储前失败
/// - `lose_next_responses`: 接下来 n 次写入实际生效，但调用方收到超时
/// - `reject_undo`: 补偿令牌（`/undo`）的写入全部失败
/// - `delay_reads`: 范围查询在返回前等待指定时间
/// - `delay_applies`: 写入生效后等待指定时间再返回
pub struct FaultyStore {
    name: String,
    inner: Arc<dyn DocumentStore>,
    state: Mutex<FaultState>,
}

impl FaultyStore {
    pub fn new(name: &str, inner: Arc<dyn DocumentStore>) -> Self {
        Self {
            name: name.to_string(),
            inner,
            state: Mutex::new(FaultState::default()),
        }
    }

    pub fn in_memory(name: &str) -> Self {
        Self::new(name, Arc::new(InMemoryStore::new(name)))
    }

    pub fn set_down(&self, down: bool) {
        self.state.lock().unwrap().down = down;
    }

    pub fn fail_next_applies(&self, count: u32) {
        self.state.lock().unwrap().fail_applies = count;
    }

    pub fn lose_next_responses(&self, count: u32) {
        self.state.lock().unwrap().lost_responses = count;
    }

    pub fn reject_undo(&self, reject: bool) {
        self.state.lock().unwrap().reject_undo = reject;
    }

    pub fn delay_reads(&self, latency: Option<Duration>) {
        self.state.lock().unwrap().read_latency = latency;
    }

    pub fn delay_applies(&self, latency: Option<Duration>) {
        self.state.lock().unwrap().apply_latency = latency;
    }

    pub fn apply_calls(&self) -> u32 {
        self.state.lock().unwrap().apply_calls
    }

    pub fn ping_calls(&self) -> u32 {
        self.state.lock().unwrap().ping_calls
    }

    pub fn inner(&self) -> &Arc<dyn DocumentStore> {
        &self.inner
    }

    fn unavailable(&self, reason: &str) -> BranchError {
        BranchError::unavailable(self.name.as_str(), reason)
    }

    fn check_up(&self) -> BranchResult<()> {
        if self.state.lock().unwrap().down {
            return Err(self.unavailable("注入故障: 分区已停机"));
        }
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for FaultyStore {
    async fn ping(&self) -> BranchResult<()> {
        self.state.lock().unwrap().ping_calls += 1;
        self.check_up()?;
        self.inner.ping().await
    }

    async fn get(&self, collection: Collection, key: &str) -> BranchResult<Option<Document>> {
        self.check_up()?;
        self.inner.get(collection, key).await
    }

    async fn find(
        &self,
        collection: Collection,
        filter: &DocumentFilter,
    ) -> BranchResult<Vec<Document>> {
        self.check_up()?;
        let latency = self.state.lock().unwrap().read_latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        self.inner.find(collection, filter).await
    }

    async fn apply(
        &self,
        token: &IdempotencyToken,
        mutations: &[Mutation],
    ) -> BranchResult<ApplyOutcome> {
        let (lose_response, latency) = {
            let mut state = self.state.lock().unwrap();
            state.apply_calls += 1;
            if state.down {
                return Err(self.unavailable("注入故障: 分区已停机"));
            }
            if state.reject_undo && token.as_str().ends_with("/undo") {
                return Err(self.unavailable("注入故障: 拒绝补偿写入"));
            }
            if state.fail_applies > 0 {
                state.fail_applies -= 1;
                return Err(self.unavailable("注入故障: 写入失败"));
            }
            let lose_response = state.lost_responses > 0;
            if lose_response {
                state.lost_responses -= 1;
            }
            (lose_response, state.apply_latency)
        };

        let outcome = self.inner.apply(token, mutations).await?;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if lose_response {
            return Err(BranchError::Timeout(format!(
                "注入故障: 分区 {} 的响应丢失",
                self.name
            )));
        }
        Ok(outcome)
    }

    async fn is_applied(&self, token: &IdempotencyToken) -> BranchResult<bool> {
        self.check_up()?;
        self.inner.is_applied(token).await
    }
}

/// 按连接串返回预先注册的存储
#[derive(Default)]
pub struct StaticConnector {
    stores: Mutex<HashMap<String, Arc<dyn DocumentStore>>>,
}

impl StaticConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_store(self, url: &str, store: Arc<dyn DocumentStore>) -> Self {
        self.register(url, store);
        self
    }

    pub fn register(&self, url: &str, store: Arc<dyn DocumentStore>) {
        self.stores.lock().unwrap().insert(url.to_string(), store);
    }
}

impl StoreConnector for StaticConnector {
    fn connect(&self, endpoint: &PartitionEndpoint) -> BranchResult<Arc<dyn DocumentStore>> {
        self.stores
            .lock()
            .unwrap()
            .get(&endpoint.url)
            .cloned()
            .ok_or_else(|| {
                BranchError::config_error(format!(
                    "没有为 {} 注册测试存储",
                    endpoint.url
                ))
            })
    }
}
