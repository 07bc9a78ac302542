pub mod app_config;
pub mod observability;
pub mod runtime;
pub mod topology;

pub use app_config::*;
pub use observability::*;
pub use runtime::*;
pub use topology::*;
