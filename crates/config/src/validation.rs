use branchdb_errors::{BranchError, BranchResult};

/// 配置验证：启动时快速失败
pub trait ConfigValidator {
    fn validate(&self) -> BranchResult<()>;
}

pub(crate) fn ensure(condition: bool, message: impl FnOnce() -> String) -> BranchResult<()> {
    if condition {
        Ok(())
    } else {
        Err(BranchError::config_error(message()))
    }
}

/// 支持的连接串：memory://<name>、sqlite:<path>、sqlite::memory:
pub fn is_supported_url(url: &str) -> bool {
    match url.strip_prefix("memory://") {
        Some(name) => !name.trim().is_empty(),
        None => url.starts_with("sqlite:") && url.len() > "sqlite:".len(),
    }
}
