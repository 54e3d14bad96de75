//! Storage abstraction used by the ingestion loop.
//!
//! A [`ProjectionStore`] hands out [`StateTransaction`]s. Everything a batch
//! writes (projected rows, dynamic registrations and the chain cursor) goes
//! through one transaction, so either all of it lands or none of it does.

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use super::error::DbError;
use super::types::{DbOperation, DbValue};

/// Equality filters for row lookups, ANDed together.
pub type Filters<'a> = [(&'a str, DbValue)];

#[async_trait]
pub trait ProjectionStore: Send + Sync + 'static {
    /// Open a new transaction.
    async fn begin(&self) -> Result<Box<dyn StateTransaction>, DbError>;

    /// Execute a schema statement outside of any batch.
    async fn execute_schema(&self, statement: &str) -> Result<(), DbError>;

    /// Read every committed row matching `filters`, rendered as JSON objects.
    async fn select(
        &self,
        table: &str,
        filters: &Filters<'_>,
    ) -> Result<Vec<JsonValue>, DbError>;
}

#[async_trait]
pub trait StateTransaction: Send {
    async fn execute(&mut self, op: &DbOperation) -> Result<(), DbError>;

    /// Read one row matching `filters`, including writes made earlier in
    /// this transaction.
    async fn query_one(
        &mut self,
        table: &str,
        filters: &Filters<'_>,
    ) -> Result<Option<JsonValue>, DbError>;

    async fn commit(self: Box<Self>) -> Result<(), DbError>;

    async fn rollback(self: Box<Self>) -> Result<(), DbError>;
}
