mod batch;
pub mod connector;
pub mod memory_store;
pub mod observability;
pub mod session;
pub mod sqlite_store;

pub use connector::DefaultConnector;
pub use memory_store::InMemoryStore;
pub use session::{PartitionHealth, SessionManager};
pub use sqlite_store::SqliteStore;
