use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::{debug, info};

use branchdb_domain::{DocumentStore, PartitionEndpoint, StoreConnector};
use branchdb_errors::{BranchError, BranchResult};

use crate::memory_store::InMemoryStore;
use crate::sqlite_store::SqliteStore;

/// 默认连接器：按连接串协议选择存储实现
///
/// - `memory://<name>`：进程内存储，同名连接共享同一实例
/// - `sqlite:<path>` / `sqlite::memory:`：SQLite 存储
#[derive(Default)]
pub struct DefaultConnector {
    memory: Mutex<HashMap<String, Arc<InMemoryStore>>>,
}

impl DefaultConnector {
    pub fn new() -> Self {
        Self::default()
    }

    fn memory_store(&self, name: &str) -> BranchResult<Arc<InMemoryStore>> {
        let mut stores = self
            .memory
            .lock()
            .map_err(|_| BranchError::Internal("内存存储注册表锁已损坏".to_string()))?;
        let store = stores
            .entry(name.to_string())
            .or_insert_with(|| {
                debug!("创建内存存储 {}", name);
                Arc::new(InMemoryStore::new(name))
            })
            .clone();
        Ok(store)
    }
}

/// 凭据只通过环境变量引用，端点描述中不保存密钥
fn check_credential(endpoint: &PartitionEndpoint) -> BranchResult<()> {
    if let Some(var) = &endpoint.credential_ref {
        if std::env::var(var).is_err() {
            return Err(BranchError::config_error(format!(
                "分区 {} 的凭据环境变量 {} 未设置",
                endpoint.id, var
            )));
        }
    }
    Ok(())
}

impl StoreConnector for DefaultConnector {
    fn connect(&self, endpoint: &PartitionEndpoint) -> BranchResult<Arc<dyn DocumentStore>> {
        check_credential(endpoint)?;
        let url = endpoint.url.trim();

        if let Some(name) = url.strip_prefix("memory://") {
            let store: Arc<dyn DocumentStore> = self.memory_store(name)?;
            info!("分区 {} 使用内存存储 {}", endpoint.id, name);
            return Ok(store);
        }
        if url.starts_with("sqlite:") {
            let store = SqliteStore::connect_lazy(url)?;
            info!("分区 {} 使用 SQLite 存储 {}", endpoint.id, url);
            return Ok(Arc::new(store));
        }
        Err(BranchError::config_error(format!(
            "分区 {} 的连接串不受支持: {}",
            endpoint.id, url
        )))
    }

    fn reconnect(
        &self,
        endpoint: &PartitionEndpoint,
    ) -> BranchResult<Option<Arc<dyn DocumentStore>>> {
        let url = endpoint.url.trim();
        if url.starts_with("memory://") || is_sqlite_memory(url) {
            return Ok(None);
        }
        self.connect(endpoint).map(Some)
    }
}

fn is_sqlite_memory(url: &str) -> bool {
    url.starts_with("sqlite:") && (url.contains(":memory:") || url.contains("mode=memory"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use branchdb_domain::{Collection, IdempotencyToken, Mutation};

    #[tokio::test]
    async fn test_memory_endpoints_share_instance_by_name() {
        let connector = DefaultConnector::new();
        let a = connector
            .connect(&PartitionEndpoint::new("p1", "memory://shared"))
            .unwrap();
        let b = connector
            .connect(&PartitionEndpoint::new("p1-replica", "memory://shared"))
            .unwrap();

        a.apply(
            &IdempotencyToken::random(),
            &[Mutation::AdjustStock {
                branch: "CN1".into(),
                warehouse: "KHO1".to_string(),
                item: "VT01".to_string(),
                delta: 1,
            }],
        )
        .await
        .unwrap();
        assert!(b.get(Collection::Inventory, "KHO1/VT01").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_unsupported_scheme_and_missing_credential() {
        let connector = DefaultConnector::new();
        assert!(connector
            .connect(&PartitionEndpoint::new("p1", "postgres://db/p1"))
            .is_err());

        let mut endpoint = PartitionEndpoint::new("p1", "memory://p1");
        endpoint.credential_ref = Some("BRANCHDB_TEST_CREDENTIAL_NEVER_SET".to_string());
        let err = connector.connect(&endpoint).err().unwrap();
        assert!(matches!(err, BranchError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_sqlite_endpoint_connects_lazily() {
        let connector = DefaultConnector::new();
        let store = connector
            .connect(&PartitionEndpoint::new("p3", "sqlite::memory:"))
            .unwrap();
        store.ping().await.unwrap();
    }

    #[tokio::test]
    async fn test_reconnect_keeps_volatile_stores() {
        let connector = DefaultConnector::new();
        for url in ["memory://p1", "sqlite::memory:", "sqlite:file:p1?mode=memory"] {
            let endpoint = PartitionEndpoint::new("p1", url);
            assert!(connector.reconnect(&endpoint).unwrap().is_none(), "{url}");
        }

        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("p2.db").display());
        let store = connector
            .reconnect(&PartitionEndpoint::new("p2", &url))
            .unwrap()
            .unwrap();
        store.ping().await.unwrap();
    }
}
