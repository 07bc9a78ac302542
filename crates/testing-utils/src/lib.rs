//! # BranchDB Testing Utils
//!
//! 工作区共享的测试工具：
//!
//! - **Builders**: 仓库、订货单、出库单、入库单的测试数据构造器
//! - **Mocks**: 可注入故障的 `FaultyStore` 和按连接串返回固定存储的 `StaticConnector`
//! - **Helpers**: 三分支测试拓扑 `TestNetwork` 与异步等待工具
//!
//! ```toml
//! [dev-dependencies]
//! branchdb-testing-utils = { path = "../testing-utils" }
//! ```

pub mod builders;
pub mod helpers;
pub mod mocks;

pub use builders::*;
pub use helpers::*;
pub use mocks::*;
