use thiserror::Error;

use crate::db::{DbError, MigrationError};
use crate::rpc::FetchError;
use crate::transformations::TransformationError;

/// Why a chain loop, or the whole indexer, stopped.
#[derive(Debug, Error)]
pub enum IngestionError {
    #[error("Chain {chain_id}: giving up after {attempts} failed fetches: {source}")]
    FetchFailed {
        chain_id: u64,
        attempts: u32,
        #[source]
        source: FetchError,
    },

    #[error("Chain {chain_id}: giving up on blocks {from_block}-{to_block} after {attempts} storage failures: {source}")]
    StorageFailed {
        chain_id: u64,
        from_block: u64,
        to_block: u64,
        attempts: u32,
        #[source]
        source: DbError,
    },

    #[error("Chain {chain_id}: handlers keep failing on blocks {from_block}-{to_block} ({attempts} attempts): {source}")]
    HandlerFailed {
        chain_id: u64,
        from_block: u64,
        to_block: u64,
        attempts: u32,
        #[source]
        source: TransformationError,
    },

    #[error("Storage error: {0}")]
    Storage(#[from] DbError),

    #[error("Migration failed: {0}")]
    Migration(#[from] MigrationError),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Chain task failed: {0}")]
    Task(String),
}
