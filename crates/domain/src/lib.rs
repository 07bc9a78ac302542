pub mod document;
pub mod entities;
pub mod ports;
pub mod transaction;
pub mod value_objects;

pub use branchdb_errors::{BranchError, BranchResult};
pub use document::*;
pub use entities::*;
pub use ports::*;
pub use transaction::*;
pub use value_objects::*;
