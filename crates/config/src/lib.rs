pub mod models;
pub mod validation;
pub mod watcher;

pub use models::{
    AggregatorConfig, AppConfig, BranchConfig, CoordinatorConfig, LogFormat, ObservabilityConfig,
    PartitionConfig, SessionConfig,
};
pub use validation::ConfigValidator;
pub use watcher::FileConfigWatcher;

pub use branchdb_errors::{BranchError, BranchResult};
