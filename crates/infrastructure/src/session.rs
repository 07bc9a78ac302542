use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::time::{interval, timeout, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use branchdb_config::SessionConfig;
use branchdb_domain::{DocumentStore, HealthStatus, PartitionEndpoint, PartitionId, StoreConnector};
use branchdb_errors::{BranchError, BranchResult};

use crate::observability::record_probe_failure;

/// 分区健康状态快照
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PartitionHealth {
    pub status: HealthStatus,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
    pub last_probe: Option<DateTime<Utc>>,
    /// unreachable 之后重建连接的次数
    pub reconnects: u32,
    /// 周期探测在此之前跳过该分区
    #[serde(skip)]
    pub next_probe_at: Option<Instant>,
}

impl Default for PartitionHealth {
    fn default() -> Self {
        Self {
            status: HealthStatus::Healthy,
            consecutive_failures: 0,
            last_error: None,
            last_probe: None,
            reconnects: 0,
            next_probe_at: None,
        }
    }
}

struct PartitionSession {
    endpoint: PartitionEndpoint,
    store: RwLock<Arc<dyn DocumentStore>>,
    health: Mutex<PartitionHealth>,
}

impl PartitionSession {
    fn new(endpoint: PartitionEndpoint, store: Arc<dyn DocumentStore>) -> Self {
        Self {
            endpoint,
            store: RwLock::new(store),
            health: Mutex::new(PartitionHealth::default()),
        }
    }

    fn store(&self) -> Arc<dyn DocumentStore> {
        match self.store.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn replace_store(&self, store: Arc<dyn DocumentStore>) {
        match self.store.write() {
            Ok(mut guard) => *guard = store,
            Err(poisoned) => *poisoned.into_inner() = store,
        }
    }

    fn health(&self) -> PartitionHealth {
        match self.health.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn update<F: FnOnce(&mut PartitionHealth)>(&self, f: F) -> PartitionHealth {
        let mut guard = match self.health.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard);
        guard.clone()
    }
}

/// 连接/会话管理器：每个分区持有一个存储句柄（连接池），并负责健康探测。
/// 健康状态只由探测结果修改。
pub struct SessionManager {
    connector: Arc<dyn StoreConnector>,
    config: SessionConfig,
    sessions: RwLock<HashMap<PartitionId, Arc<PartitionSession>>>,
}

impl SessionManager {
    pub fn new(connector: Arc<dyn StoreConnector>, config: SessionConfig) -> Self {
        Self {
            connector,
            config,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// 让持有的连接与端点列表一致：新增端点建立连接，连接串变化的端点重新连接，
    /// 不再出现的端点释放连接。
    pub fn sync_endpoints(&self, endpoints: &[PartitionEndpoint]) -> BranchResult<()> {
        let current = self.read_sessions()?;

        let mut next = HashMap::with_capacity(endpoints.len());
        for endpoint in endpoints {
            match current.get(&endpoint.id) {
                Some(existing) if existing.endpoint == *endpoint => {
                    next.insert(endpoint.id.clone(), existing.clone());
                }
                existing => {
                    if existing.is_some() {
                        warn!("分区 {} 的端点已变更，重新连接", endpoint.id);
                    } else {
                        info!("连接分区 {} ({})", endpoint.id, endpoint.url);
                    }
                    let store = self.connector.connect(endpoint)?;
                    next.insert(
                        endpoint.id.clone(),
                        Arc::new(PartitionSession::new(endpoint.clone(), store)),
                    );
                }
            }
        }
        for id in current.keys().filter(|id| !next.contains_key(*id)) {
            info!("释放分区 {} 的连接", id);
        }

        let mut sessions = self
            .sessions
            .write()
            .map_err(|_| BranchError::Internal("会话表锁已损坏".to_string()))?;
        *sessions = next;
        Ok(())
    }

    fn read_sessions(&self) -> BranchResult<HashMap<PartitionId, Arc<PartitionSession>>> {
        let sessions = self
            .sessions
            .read()
            .map_err(|_| BranchError::Internal("会话表锁已损坏".to_string()))?;
        Ok(sessions.clone())
    }

    fn session(&self, partition: &PartitionId) -> BranchResult<Arc<PartitionSession>> {
        let sessions = self
            .sessions
            .read()
            .map_err(|_| BranchError::Internal("会话表锁已损坏".to_string()))?;
        sessions
            .get(partition)
            .cloned()
            .ok_or_else(|| BranchError::unknown_partition(partition.as_str()))
    }

    /// 借用分区存储句柄。unreachable 的分区直接失败，不等待超时。
    pub fn handle(&self, partition: &PartitionId) -> BranchResult<Arc<dyn DocumentStore>> {
        let session = self.session(partition)?;
        let health = session.health();
        if !health.status.accepts_dispatch() {
            return Err(BranchError::unavailable(
                partition.as_str(),
                format!(
                    "连续 {} 次健康探测失败: {}",
                    health.consecutive_failures,
                    health.last_error.unwrap_or_default()
                ),
            ));
        }
        Ok(session.store())
    }

    pub fn status(&self, partition: &PartitionId) -> BranchResult<HealthStatus> {
        Ok(self.session(partition)?.health().status)
    }

    pub fn health(&self, partition: &PartitionId) -> BranchResult<PartitionHealth> {
        Ok(self.session(partition)?.health())
    }

    pub fn health_report(&self) -> BranchResult<Vec<(PartitionId, PartitionHealth)>> {
        let mut report: Vec<_> = self
            .read_sessions()?
            .into_iter()
            .map(|(id, session)| (id, session.health()))
            .collect();
        report.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(report)
    }

    /// 探测单个分区并更新健康状态。分区处于 unreachable 时丢弃旧连接并重新连接，
    /// 同时按退避时间推迟下一次周期探测。
    pub async fn probe(&self, partition: &PartitionId) -> BranchResult<HealthStatus> {
        let session = self.session(partition)?;
        let store = session.store();
        let result = match timeout(self.config.probe_timeout(), store.ping()).await {
            Ok(result) => result,
            Err(_) => Err(BranchError::Timeout(format!(
                "健康探测超过 {}ms",
                self.config.probe_timeout_ms
            ))),
        };

        let threshold = self.config.failure_threshold;
        let previous = session.health().status;
        let health = session.update(|health| {
            health.last_probe = Some(Utc::now());
            match &result {
                Ok(()) => {
                    health.consecutive_failures = 0;
                    health.last_error = None;
                    health.status = HealthStatus::Healthy;
                    health.next_probe_at = None;
                }
                Err(e) => {
                    health.consecutive_failures = health.consecutive_failures.saturating_add(1);
                    health.last_error = Some(e.to_string());
                    if health.consecutive_failures >= threshold {
                        health.status = HealthStatus::Unreachable;
                        let backoff = self.config.unreachable_backoff(health.consecutive_failures);
                        health.next_probe_at = Some(Instant::now() + backoff);
                    } else {
                        health.status = HealthStatus::Degraded;
                    }
                }
            }
        });

        if health.status == HealthStatus::Unreachable {
            self.reconnect(partition, &session);
        }

        if let Err(e) = &result {
            record_probe_failure(partition.as_str());
            debug!("分区 {} 健康探测失败: {}", partition, e);
        }
        if health.status != previous {
            match health.status {
                HealthStatus::Healthy => info!("分区 {} 恢复健康", partition),
                status => warn!(
                    "分区 {} 状态变为 {}（连续失败 {} 次）",
                    partition,
                    status.as_str(),
                    health.consecutive_failures
                ),
            }
        }
        Ok(health.status)
    }

    fn reconnect(&self, partition: &PartitionId, session: &PartitionSession) {
        match self.connector.reconnect(&session.endpoint) {
            Ok(None) => debug!("分区 {} 的存储不可重建，保留原句柄", partition),
            Ok(Some(store)) => {
                session.replace_store(store);
                let health = session.update(|health| health.reconnects += 1);
                debug!("分区 {} 已重建连接（第 {} 次）", partition, health.reconnects);
            }
            Err(e) => warn!("分区 {} 重建连接失败: {}", partition, e),
        }
    }

    pub async fn probe_all(&self) -> BranchResult<Vec<(PartitionId, HealthStatus)>> {
        let mut ids: Vec<PartitionId> = self.read_sessions()?.into_keys().collect();
        ids.sort();
        self.probe_each(ids).await
    }

    /// 只探测不在退避期内的分区，周期探测使用
    pub async fn probe_due(&self) -> BranchResult<Vec<(PartitionId, HealthStatus)>> {
        let now = Instant::now();
        let mut ids: Vec<PartitionId> = self
            .read_sessions()?
            .into_iter()
            .filter(|(_, session)| session.health().next_probe_at.map_or(true, |at| at <= now))
            .map(|(id, _)| id)
            .collect();
        ids.sort();
        self.probe_each(ids).await
    }

    async fn probe_each(
        &self,
        ids: Vec<PartitionId>,
    ) -> BranchResult<Vec<(PartitionId, HealthStatus)>> {
        let results = join_all(ids.iter().map(|id| self.probe(id))).await;
        ids.into_iter()
            .zip(results)
            .map(|(id, status)| status.map(|s| (id, s)))
            .collect()
    }

    /// 周期性健康探测，收到关闭信号后退出
    pub async fn run_probe_loop(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = interval(self.config.probe_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("健康探测已启动，间隔 {}ms", self.config.probe_interval_ms);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.probe_due().await {
                        warn!("健康探测失败: {}", e);
                    }
                }
                _ = shutdown.recv() => {
                    info!("收到关闭信号，停止健康探测");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::DefaultConnector;
    use crate::memory_store::InMemoryStore;
    use async_trait::async_trait;
    use branchdb_domain::{
        ApplyOutcome, Collection, Document, DocumentFilter, IdempotencyToken, Mutation,
    };
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    fn manager() -> SessionManager {
        let manager = SessionManager::new(
            Arc::new(DefaultConnector::new()),
            SessionConfig::default(),
        );
        manager
            .sync_endpoints(&[
                PartitionEndpoint::new("p1", "memory://p1"),
                PartitionEndpoint::new("p2", "memory://p2"),
            ])
            .unwrap();
        manager
    }

    #[tokio::test]
    async fn test_handles_and_unknown_partition() {
        let manager = manager();
        assert!(manager.handle(&PartitionId::new("p1")).is_ok());
        let err = manager.handle(&PartitionId::new("p9")).err().unwrap();
        assert!(matches!(err, BranchError::UnknownPartition { .. }));

        let statuses = manager.probe_all().await.unwrap();
        assert_eq!(statuses.len(), 2);
        assert!(statuses.iter().all(|(_, s)| *s == HealthStatus::Healthy));
    }

    #[tokio::test]
    async fn test_sync_endpoints_keeps_existing_sessions() {
        let manager = manager();
        let before = manager.handle(&PartitionId::new("p1")).unwrap();
        manager
            .sync_endpoints(&[
                PartitionEndpoint::new("p1", "memory://p1"),
                PartitionEndpoint::new("p3", "memory://p3"),
            ])
            .unwrap();
        let after = manager.handle(&PartitionId::new("p1")).unwrap();
        assert!(Arc::ptr_eq(&before, &after));
        assert!(manager.handle(&PartitionId::new("p3")).is_ok());
        assert!(manager.handle(&PartitionId::new("p2")).is_err());
    }

    #[tokio::test]
    async fn test_health_check_loop_stops_on_shutdown() {
        let manager = Arc::new(manager());
        let (tx, rx) = broadcast::channel(1);
        let task = tokio::spawn(manager.clone().run_probe_loop(rx));
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        tx.send(()).unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert!(manager.health(&PartitionId::new("p1")).unwrap().last_probe.is_some());
    }

    /// 可以切换在线状态的存储
    struct SwitchableStore {
        inner: InMemoryStore,
        down: AtomicBool,
    }

    #[async_trait]
    impl DocumentStore for SwitchableStore {
        async fn ping(&self) -> BranchResult<()> {
            if self.down.load(Ordering::SeqCst) {
                return Err(BranchError::unavailable("p1", "connection refused"));
            }
            self.inner.ping().await
        }

        async fn get(&self, collection: Collection, key: &str) -> BranchResult<Option<Document>> {
            self.inner.get(collection, key).await
        }

        async fn find(
            &self,
            collection: Collection,
            filter: &DocumentFilter,
        ) -> BranchResult<Vec<Document>> {
            self.inner.find(collection, filter).await
        }

        async fn apply(
            &self,
            token: &IdempotencyToken,
            mutations: &[Mutation],
        ) -> BranchResult<ApplyOutcome> {
            self.inner.apply(token, mutations).await
        }

        async fn is_applied(&self, token: &IdempotencyToken) -> BranchResult<bool> {
            self.inner.is_applied(token).await
        }
    }

    struct SwitchableConnector {
        store: Arc<SwitchableStore>,
        connects: AtomicUsize,
    }

    impl SwitchableConnector {
        fn new(store: Arc<SwitchableStore>) -> Self {
            Self {
                store,
                connects: AtomicUsize::new(0),
            }
        }
    }

    impl StoreConnector for SwitchableConnector {
        fn connect(&self, _: &PartitionEndpoint) -> BranchResult<Arc<dyn DocumentStore>> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            Ok(self.store.clone())
        }
    }

    #[tokio::test]
    async fn test_health_transitions() {
        let store = Arc::new(SwitchableStore {
            inner: InMemoryStore::new("p1"),
            down: AtomicBool::new(true),
        });
        let manager = SessionManager::new(
            Arc::new(SwitchableConnector::new(store.clone())),
            SessionConfig::default(),
        );
        manager
            .sync_endpoints(&[PartitionEndpoint::new("p1", "memory://p1")])
            .unwrap();
        let p1 = PartitionId::new("p1");

        assert_eq!(manager.probe(&p1).await.unwrap(), HealthStatus::Degraded);
        assert!(manager.handle(&p1).is_ok());
        assert_eq!(manager.probe(&p1).await.unwrap(), HealthStatus::Degraded);
        assert_eq!(manager.probe(&p1).await.unwrap(), HealthStatus::Unreachable);

        let err = manager.handle(&p1).err().unwrap();
        assert!(matches!(err, BranchError::PartitionUnavailable { .. }));
        assert_eq!(manager.health(&p1).unwrap().consecutive_failures, 3);

        store.down.store(false, Ordering::SeqCst);
        assert_eq!(manager.probe(&p1).await.unwrap(), HealthStatus::Healthy);
        assert!(manager.handle(&p1).is_ok());
        assert_eq!(manager.health(&p1).unwrap().consecutive_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_partition_backs_off_and_reconnects() {
        let store = Arc::new(SwitchableStore {
            inner: InMemoryStore::new("p1"),
            down: AtomicBool::new(true),
        });
        let connector = Arc::new(SwitchableConnector::new(store.clone()));
        let config = SessionConfig {
            probe_interval_ms: 1_000,
            failure_threshold: 2,
            max_probe_backoff_ms: 4_000,
            ..SessionConfig::default()
        };
        let manager = SessionManager::new(connector.clone(), config);
        manager
            .sync_endpoints(&[PartitionEndpoint::new("p1", "memory://p1")])
            .unwrap();
        let p1 = PartitionId::new("p1");
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);

        // degraded 不退避也不重连
        assert_eq!(manager.probe_due().await.unwrap().len(), 1);
        assert_eq!(manager.status(&p1).unwrap(), HealthStatus::Degraded);
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
        assert_eq!(manager.probe_due().await.unwrap().len(), 1);
        assert_eq!(manager.status(&p1).unwrap(), HealthStatus::Unreachable);
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
        assert_eq!(manager.health(&p1).unwrap().reconnects, 1);

        // 第2次失败后退避 1s
        assert!(manager.probe_due().await.unwrap().is_empty());
        tokio::time::advance(Duration::from_millis(1_000)).await;
        assert_eq!(manager.probe_due().await.unwrap().len(), 1);
        assert_eq!(connector.connects.load(Ordering::SeqCst), 3);

        // 第3次失败后退避 2s
        tokio::time::advance(Duration::from_millis(1_500)).await;
        assert!(manager.probe_due().await.unwrap().is_empty());
        tokio::time::advance(Duration::from_millis(500)).await;
        assert_eq!(manager.probe_due().await.unwrap().len(), 1);

        // 显式探测不受退避限制，恢复后清除退避
        store.down.store(false, Ordering::SeqCst);
        assert_eq!(manager.probe(&p1).await.unwrap(), HealthStatus::Healthy);
        assert!(manager.health(&p1).unwrap().next_probe_at.is_none());
        assert_eq!(manager.probe_due().await.unwrap().len(), 1);
        assert!(manager.handle(&p1).is_ok());
    }
}
