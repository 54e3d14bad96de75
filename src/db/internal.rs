//! Tables the engine owns, independent of any domain schema.

use serde_json::Value as JsonValue;

use super::error::DbError;
use super::store::{ProjectionStore, StateTransaction};
use super::types::{DbOperation, DbValue, MultiChainRow};

pub const CURSOR_TABLE: &str = "_chain_cursors";
pub const REGISTRY_TABLE: &str = "_watched_contracts";
pub const RESET_TABLE: &str = "_reset_counts";

pub const INTERNAL_SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS _chain_cursors (
        chain_id BIGINT PRIMARY KEY,
        last_block BIGINT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS _watched_contracts (
        chain_id BIGINT NOT NULL,
        address TEXT NOT NULL,
        contract_type TEXT NOT NULL,
        start_block BIGINT NOT NULL,
        PRIMARY KEY (chain_id, address, contract_type)
    )",
    "CREATE TABLE IF NOT EXISTS _reset_counts (
        id BIGINT PRIMARY KEY,
        reset_count BIGINT NOT NULL
    )",
];

/// Forget every chain's progress and every dynamic registration.
pub const RESET_STATEMENTS: &[&str] = &["DELETE FROM _chain_cursors", "DELETE FROM _watched_contracts"];

/// Cursor write for a committed batch. Merged with `GREATEST` so the stored
/// cursor can never move backwards.
pub fn cursor_operation(chain_id: u64, last_block: u64) -> DbOperation {
    MultiChainRow::new(CURSOR_TABLE)
        .key("chain_id", chain_id)
        .max("last_block", last_block)
        .into_operation()
}

/// Cursor as seen from inside an open transaction.
pub async fn read_cursor(
    tx: &mut dyn StateTransaction,
    chain_id: u64,
) -> Result<Option<u64>, DbError> {
    let row = tx
        .query_one(CURSOR_TABLE, &[("chain_id", DbValue::Uint64(chain_id))])
        .await?;
    Ok(row.as_ref().and_then(last_block_of))
}

/// Last committed cursor for a chain.
pub async fn load_cursor(store: &dyn ProjectionStore, chain_id: u64) -> Result<Option<u64>, DbError> {
    let rows = store
        .select(CURSOR_TABLE, &[("chain_id", DbValue::Uint64(chain_id))])
        .await?;
    Ok(rows.first().and_then(last_block_of))
}

/// Record a completed reset. Never lowers the stored count.
pub fn reset_count_operation(count: u64) -> DbOperation {
    MultiChainRow::new(RESET_TABLE)
        .key("id", 1i64)
        .max("reset_count", count)
        .into_operation()
}

/// Number of resets applied to this database so far.
pub async fn load_reset_count(store: &dyn ProjectionStore) -> Result<u64, DbError> {
    let rows = store.select(RESET_TABLE, &[("id", DbValue::Int64(1))]).await?;
    Ok(rows
        .first()
        .and_then(|row| row.get("reset_count"))
        .and_then(JsonValue::as_u64)
        .unwrap_or(0))
}

fn last_block_of(row: &JsonValue) -> Option<u64> {
    row.get("last_block").and_then(JsonValue::as_u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory::MemoryStore;

    #[tokio::test]
    async fn cursor_never_moves_backwards() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        tx.execute(&cursor_operation(1, 120)).await.unwrap();
        tx.execute(&cursor_operation(1, 100)).await.unwrap();
        assert_eq!(read_cursor(tx.as_mut(), 1).await.unwrap(), Some(120));
        tx.commit().await.unwrap();

        assert_eq!(load_cursor(&store, 1).await.unwrap(), Some(120));
        assert_eq!(load_cursor(&store, 2).await.unwrap(), None);
    }
}
