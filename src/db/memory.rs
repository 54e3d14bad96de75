//! In-memory [`ProjectionStore`].
//!
//! Transactions are serialized: `begin` takes the table lock and works on a
//! copy, `commit` swaps the copy in. Rows read back as the same JSON shape
//! PostgreSQL's `to_jsonb` produces for the equivalent column types.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use alloy::primitives::aliases::I512;
use async_trait::async_trait;
use serde_json::Value as JsonValue;
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::error::DbError;
use super::store::{Filters, ProjectionStore, StateTransaction};
use super::types::{address_hex, DbOperation, DbValue, MergeRule};

pub type MemoryRow = BTreeMap<String, DbValue>;

#[derive(Debug, Default, Clone)]
struct MemoryTables {
    tables: HashMap<String, Vec<MemoryRow>>,
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    tables: Arc<Mutex<MemoryTables>>,
    schema: Arc<Mutex<Vec<String>>>,
    reject_schema: Option<String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store whose `execute_schema` fails for statements containing `pattern`.
    pub fn rejecting_schema(pattern: impl Into<String>) -> Self {
        Self {
            reject_schema: Some(pattern.into()),
            ..Self::default()
        }
    }

    /// Committed rows of `table`, in insertion order.
    pub async fn rows(&self, table: &str) -> Vec<MemoryRow> {
        let tables = self.tables.lock().await;
        tables.tables.get(table).cloned().unwrap_or_default()
    }

    /// Schema statements executed so far, in order.
    pub async fn schema_statements(&self) -> Vec<String> {
        self.schema.lock().await.clone()
    }
}

#[async_trait]
impl ProjectionStore for MemoryStore {
    async fn begin(&self) -> Result<Box<dyn StateTransaction>, DbError> {
        let guard = self.tables.clone().lock_owned().await;
        let working = guard.clone();
        Ok(Box::new(MemoryTransaction { guard, working }))
    }

    async fn execute_schema(&self, statement: &str) -> Result<(), DbError> {
        if let Some(pattern) = &self.reject_schema {
            if statement.contains(pattern.as_str()) {
                return Err(DbError::Unsupported(format!(
                    "schema statement rejected: {}",
                    statement
                )));
            }
        }
        if let Some(table) = cleared_table(statement) {
            self.tables.lock().await.tables.remove(table);
        }
        self.schema.lock().await.push(statement.to_string());
        Ok(())
    }

    async fn select(
        &self,
        table: &str,
        filters: &Filters<'_>,
    ) -> Result<Vec<JsonValue>, DbError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .tables
            .get(table)
            .map(|rows| {
                rows.iter()
                    .filter(|row| matches_filters(row, filters))
                    .map(row_to_json)
                    .collect()
            })
            .unwrap_or_default())
    }
}

pub struct MemoryTransaction {
    guard: OwnedMutexGuard<MemoryTables>,
    working: MemoryTables,
}

#[async_trait]
impl StateTransaction for MemoryTransaction {
    async fn execute(&mut self, op: &DbOperation) -> Result<(), DbError> {
        apply(&mut self.working, op)
    }

    async fn query_one(
        &mut self,
        table: &str,
        filters: &Filters<'_>,
    ) -> Result<Option<JsonValue>, DbError> {
        Ok(self
            .working
            .tables
            .get(table)
            .and_then(|rows| rows.iter().find(|row| matches_filters(row, filters)))
            .map(row_to_json))
    }

    async fn commit(self: Box<Self>) -> Result<(), DbError> {
        let MemoryTransaction { mut guard, working } = *self;
        *guard = working;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), DbError> {
        Ok(())
    }
}

/// Table emptied by a `DROP TABLE IF EXISTS` or `DELETE FROM` statement.
/// Every other schema statement only gets recorded.
fn cleared_table(statement: &str) -> Option<&str> {
    let statement = statement.trim();
    let rest = statement
        .strip_prefix("DROP TABLE IF EXISTS ")
        .or_else(|| statement.strip_prefix("DELETE FROM "))?;
    rest.trim_end_matches(';').split_whitespace().next()
}

fn matches_filters(row: &MemoryRow, filters: &Filters<'_>) -> bool {
    filters.iter().all(|(col, val)| column_matches(row, col, val))
}

fn column_matches(row: &MemoryRow, column: &str, value: &DbValue) -> bool {
    match row.get(column) {
        Some(stored) => values_equal(stored, value),
        None => value.is_null(),
    }
}

/// Numeric-aware equality, so `Uint64(1)` matches `Numeric("1")` the way
/// PostgreSQL compares a BIGINT column with a NUMERIC parameter.
fn values_equal(a: &DbValue, b: &DbValue) -> bool {
    match (as_number(a), as_number(b)) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn key_of(row: &MemoryRow, conflict_columns: &[String], incoming: &MemoryRow) -> bool {
    conflict_columns.iter().all(|col| {
        let want = incoming.get(col).unwrap_or(&DbValue::Null);
        column_matches(row, col, want)
    })
}

fn build_row(columns: &[String], values: &[DbValue]) -> MemoryRow {
    columns.iter().cloned().zip(values.iter().cloned()).collect()
}

fn apply(tables: &mut MemoryTables, op: &DbOperation) -> Result<(), DbError> {
    let rows = tables.tables.entry(op.table().to_string()).or_default();

    match op {
        DbOperation::Upsert {
            columns,
            values,
            conflict_columns,
            update_columns,
            ..
        } => {
            let incoming = build_row(columns, values);
            match rows.iter_mut().find(|r| key_of(r, conflict_columns, &incoming)) {
                Some(existing) => {
                    for col in update_columns {
                        let value = incoming.get(col).cloned().unwrap_or(DbValue::Null);
                        existing.insert(col.clone(), value);
                    }
                }
                None => rows.push(incoming),
            }
        }
        DbOperation::Merge {
            table,
            columns,
            values,
            conflict_columns,
            rules,
        } => {
            let incoming = build_row(columns, values);
            match rows.iter_mut().find(|r| key_of(r, conflict_columns, &incoming)) {
                Some(existing) => {
                    for (col, rule) in rules {
                        let current = existing.get(col).cloned().unwrap_or(DbValue::Null);
                        let next = incoming.get(col).cloned().unwrap_or(DbValue::Null);
                        let merged = merge_value(table, col, *rule, current, next)?;
                        existing.insert(col.clone(), merged);
                    }
                }
                None => rows.push(incoming),
            }
        }
    }
    Ok(())
}

/// Wide enough for the sum of two uint256 values.
fn as_number(value: &DbValue) -> Option<I512> {
    match value {
        DbValue::Int64(v) => I512::from_dec_str(&v.to_string()).ok(),
        DbValue::Int32(v) => I512::from_dec_str(&v.to_string()).ok(),
        DbValue::Uint64(v) => I512::from_dec_str(&v.to_string()).ok(),
        DbValue::Numeric(s) => I512::from_dec_str(s).ok(),
        _ => None,
    }
}

fn merge_value(
    table: &str,
    column: &str,
    rule: MergeRule,
    current: DbValue,
    incoming: DbValue,
) -> Result<DbValue, DbError> {
    let fail = |reason: &str| DbError::MergeError {
        table: table.to_string(),
        column: column.to_string(),
        reason: reason.to_string(),
    };

    match rule {
        MergeRule::Replace => Ok(incoming),
        MergeRule::KeepExisting => Ok(current),
        _ if incoming.is_null() => Ok(current),
        _ if current.is_null() => Ok(incoming),
        MergeRule::Add => {
            let a = as_number(&current).ok_or_else(|| fail("stored value is not numeric"))?;
            let b = as_number(&incoming).ok_or_else(|| fail("incoming value is not numeric"))?;
            let sum = a.checked_add(b).ok_or_else(|| fail("overflow"))?;
            Ok(match (&current, &incoming) {
                (DbValue::Uint64(_), DbValue::Uint64(_)) => sum
                    .to_string()
                    .parse()
                    .map(DbValue::Uint64)
                    .map_err(|_| fail("overflow"))?,
                (DbValue::Int64(_), DbValue::Int64(_)) => sum
                    .to_string()
                    .parse()
                    .map(DbValue::Int64)
                    .map_err(|_| fail("overflow"))?,
                _ => DbValue::Numeric(sum.to_string()),
            })
        }
        MergeRule::Max | MergeRule::Min => {
            let a = as_number(&current).ok_or_else(|| fail("stored value is not numeric"))?;
            let b = as_number(&incoming).ok_or_else(|| fail("incoming value is not numeric"))?;
            let take_incoming = if rule == MergeRule::Max { b > a } else { b < a };
            Ok(if take_incoming { incoming } else { current })
        }
    }
}

fn value_to_json(value: &DbValue) -> JsonValue {
    match value {
        DbValue::Null => JsonValue::Null,
        DbValue::Bool(v) => JsonValue::Bool(*v),
        DbValue::Int64(v) => JsonValue::from(*v),
        DbValue::Int32(v) => JsonValue::from(*v),
        DbValue::Uint64(v) => JsonValue::from(*v),
        DbValue::Text(v) => JsonValue::String(v.clone()),
        DbValue::Address(v) => JsonValue::String(address_hex(v)),
        DbValue::Bytes(v) => JsonValue::String(format!("\\x{}", hex::encode(v))),
        DbValue::Bytes32(v) => JsonValue::String(format!("\\x{}", hex::encode(v))),
        DbValue::Numeric(v) => JsonValue::String(v.clone()),
        DbValue::Json(v) => v.clone(),
    }
}

fn row_to_json(row: &MemoryRow) -> JsonValue {
    JsonValue::Object(
        row.iter()
            .map(|(k, v)| (k.clone(), value_to_json(v)))
            .collect(),
    )
}
