pub mod error;
pub mod internal;
pub mod memory;
pub mod migrations;
pub mod pool;
pub mod store;
pub mod types;

pub use error::DbError;
pub use memory::MemoryStore;
pub use migrations::{MigrationError, MigrationRunner, StateMigrations};
pub use pool::DbPool;
pub use store::{Filters, ProjectionStore, StateTransaction};
pub use types::{DbOperation, DbValue, MergeRule, MultiChainRow, SingleChainRow};
