use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tokio::time::sleep;
use tracing::debug;

use branchdb_errors::{BranchError, BranchResult};

use crate::models::AppConfig;

/// 轮询配置文件修改时间，文件变化时重新加载并验证
pub struct FileConfigWatcher {
    file_path: PathBuf,
    last_modified: Option<SystemTime>,
    polling_interval: Duration,
}

impl FileConfigWatcher {
    /// 以当前修改时间为基线，只有之后的变化才会触发重载
    pub fn new(file_path: impl Into<PathBuf>) -> BranchResult<Self> {
        let file_path = file_path.into();
        let last_modified = modified_time(&file_path)?;
        Ok(Self {
            file_path,
            last_modified,
            polling_interval: Duration::from_secs(5),
        })
    }

    pub fn with_polling_interval(mut self, interval: Duration) -> Self {
        self.polling_interval = interval;
        self
    }

    pub fn path(&self) -> &Path {
        &self.file_path
    }

    /// 检查一次，文件有变化时返回新配置
    pub fn poll(&mut self) -> BranchResult<Option<AppConfig>> {
        let current = modified_time(&self.file_path)?;
        if current == self.last_modified {
            return Ok(None);
        }
        self.last_modified = current;
        if current.is_none() {
            debug!("配置文件已被删除: {}", self.file_path.display());
            return Ok(None);
        }

        let path = self.file_path.to_string_lossy().to_string();
        AppConfig::load(Some(&path)).map(Some)
    }

    /// 等待下一次配置变化。解析或验证失败会返回错误，调用方记录日志后继续等待。
    pub async fn wait_for_change(&mut self) -> BranchResult<AppConfig> {
        loop {
            if let Some(config) = self.poll()? {
                return Ok(config);
            }
            sleep(self.polling_interval).await;
        }
    }
}

fn modified_time(path: &Path) -> BranchResult<Option<SystemTime>> {
    if !path.exists() {
        return Ok(None);
    }
    let metadata = std::fs::metadata(path)
        .map_err(|e| BranchError::config_error(format!("读取配置文件元数据失败: {e}")))?;
    let modified = metadata
        .modified()
        .map_err(|e| BranchError::config_error(format!("获取修改时间失败: {e}")))?;
    Ok(Some(modified))
}
