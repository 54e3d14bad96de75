use alloy::primitives::{Address, B256, I256, U256};
use serde::Serialize;
use serde_json::Value as JsonValue;

/// Column the engine adds to every single-chain projection row.
pub const CHAIN_ID_COLUMN: &str = "chain_id";

/// A column value of a projected row.
///
/// Integers wider than 64 bits travel as [`DbValue::Numeric`] decimal
/// strings so `uint256` amounts are stored exactly.
#[derive(Debug, Clone, PartialEq)]
pub enum DbValue {
    Null,
    Bool(bool),
    Int64(i64),
    Int32(i32),
    /// BIGINT; values above `i64::MAX` are sent as NUMERIC.
    Uint64(u64),
    Text(String),
    Bytes(Vec<u8>),
    /// Lowercase `0x` hex TEXT.
    Address([u8; 20]),
    Bytes32([u8; 32]),
    Numeric(String),
    Json(JsonValue),
}

impl DbValue {
    pub fn is_null(&self) -> bool {
        matches!(self, DbValue::Null)
    }

    pub fn json<T: Serialize>(value: T) -> Result<Self, serde_json::Error> {
        serde_json::to_value(value).map(DbValue::Json)
    }
}

/// Lowercase `0x`-prefixed hex rendering used for every stored address.
pub fn address_hex(bytes: &[u8; 20]) -> String {
    format!("0x{}", hex::encode(bytes))
}

impl From<Address> for DbValue {
    fn from(value: Address) -> Self {
        DbValue::Address(value.into_array())
    }
}

impl From<B256> for DbValue {
    fn from(value: B256) -> Self {
        DbValue::Bytes32(value.0)
    }
}

impl From<U256> for DbValue {
    fn from(value: U256) -> Self {
        DbValue::Numeric(value.to_string())
    }
}

impl From<I256> for DbValue {
    fn from(value: I256) -> Self {
        DbValue::Numeric(value.to_string())
    }
}

impl From<u64> for DbValue {
    fn from(value: u64) -> Self {
        DbValue::Uint64(value)
    }
}

impl From<i64> for DbValue {
    fn from(value: i64) -> Self {
        DbValue::Int64(value)
    }
}

impl From<i32> for DbValue {
    fn from(value: i32) -> Self {
        DbValue::Int32(value)
    }
}

impl From<bool> for DbValue {
    fn from(value: bool) -> Self {
        DbValue::Bool(value)
    }
}

impl From<String> for DbValue {
    fn from(value: String) -> Self {
        DbValue::Text(value)
    }
}

impl From<&str> for DbValue {
    fn from(value: &str) -> Self {
        DbValue::Text(value.to_string())
    }
}

/// How a multi-chain column combines an incoming value with the stored one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeRule {
    /// Overwrite with the incoming value.
    Replace,
    /// Stored value plus incoming value.
    Add,
    /// Larger of the two.
    Max,
    /// Smaller of the two.
    Min,
    /// Only written when the row is first inserted.
    KeepExisting,
}

/// Database operation produced while dispatching a batch.
#[derive(Debug, Clone, PartialEq)]
pub enum DbOperation {
    /// INSERT with ON CONFLICT DO UPDATE (upsert)
    Upsert {
        table: String,
        columns: Vec<String>,
        values: Vec<DbValue>,
        /// Columns that form the unique constraint
        conflict_columns: Vec<String>,
        /// Columns to overwrite on conflict; empty means DO NOTHING
        update_columns: Vec<String>,
    },
    /// INSERT with ON CONFLICT DO UPDATE where every updated column
    /// is combined with the stored value by its rule, in one statement.
    Merge {
        table: String,
        columns: Vec<String>,
        values: Vec<DbValue>,
        conflict_columns: Vec<String>,
        rules: Vec<(String, MergeRule)>,
    },
}

impl DbOperation {
    pub fn table(&self) -> &str {
        match self {
            DbOperation::Upsert { table, .. } | DbOperation::Merge { table, .. } => table,
        }
    }
}

// ─── Projection rows ─────────────────────────────────────────────────

/// A row of chain-scoped state. The chain id is added to both the row and
/// its unique key when the row is written, so the same key on two chains
/// never collides. Conflicts overwrite every non-key column.
#[derive(Debug, Clone)]
pub struct SingleChainRow {
    table: String,
    key: Vec<(String, DbValue)>,
    values: Vec<(String, DbValue)>,
}

impl SingleChainRow {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            key: Vec::new(),
            values: Vec::new(),
        }
    }

    pub fn key(mut self, column: impl Into<String>, value: impl Into<DbValue>) -> Self {
        self.key.push((column.into(), value.into()));
        self
    }

    pub fn set(mut self, column: impl Into<String>, value: impl Into<DbValue>) -> Self {
        self.values.push((column.into(), value.into()));
        self
    }

    pub(crate) fn into_operation(self, chain_id: u64) -> DbOperation {
        let mut columns = vec![CHAIN_ID_COLUMN.to_string()];
        let mut values = vec![DbValue::Uint64(chain_id)];
        let mut conflict_columns = vec![CHAIN_ID_COLUMN.to_string()];
        let mut update_columns = Vec::with_capacity(self.values.len());

        for (col, val) in self.key {
            conflict_columns.push(col.clone());
            columns.push(col);
            values.push(val);
        }
        for (col, val) in self.values {
            update_columns.push(col.clone());
            columns.push(col);
            values.push(val);
        }

        DbOperation::Upsert {
            table: self.table,
            columns,
            values,
            conflict_columns,
            update_columns,
        }
    }
}

/// A row aggregated across chains under a chain-agnostic key. Each non-key
/// column carries the rule used to merge it into an existing row.
#[derive(Debug, Clone)]
pub struct MultiChainRow {
    table: String,
    key: Vec<(String, DbValue)>,
    values: Vec<(String, DbValue, MergeRule)>,
}

impl MultiChainRow {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            key: Vec::new(),
            values: Vec::new(),
        }
    }

    pub fn key(mut self, column: impl Into<String>, value: impl Into<DbValue>) -> Self {
        self.key.push((column.into(), value.into()));
        self
    }

    pub fn column(
        mut self,
        column: impl Into<String>,
        value: impl Into<DbValue>,
        rule: MergeRule,
    ) -> Self {
        self.values.push((column.into(), value.into(), rule));
        self
    }

    pub fn set(self, column: impl Into<String>, value: impl Into<DbValue>) -> Self {
        self.column(column, value, MergeRule::Replace)
    }

    pub fn accumulate(self, column: impl Into<String>, value: impl Into<DbValue>) -> Self {
        self.column(column, value, MergeRule::Add)
    }

    pub fn max(self, column: impl Into<String>, value: impl Into<DbValue>) -> Self {
        self.column(column, value, MergeRule::Max)
    }

    pub fn min(self, column: impl Into<String>, value: impl Into<DbValue>) -> Self {
        self.column(column, value, MergeRule::Min)
    }

    pub fn set_once(self, column: impl Into<String>, value: impl Into<DbValue>) -> Self {
        self.column(column, value, MergeRule::KeepExisting)
    }

    pub(crate) fn into_operation(self) -> DbOperation {
        let mut columns = Vec::with_capacity(self.key.len() + self.values.len());
        let mut values = Vec::with_capacity(columns.capacity());
        let mut conflict_columns = Vec::with_capacity(self.key.len());
        let mut rules = Vec::with_capacity(self.values.len());

        for (col, val) in self.key {
            conflict_columns.push(col.clone());
            columns.push(col);
            values.push(val);
        }
        for (col, val, rule) in self.values {
            rules.push((col.clone(), rule));
            columns.push(col);
            values.push(val);
        }

        DbOperation::Merge {
            table: self.table,
            columns,
            values,
            conflict_columns,
            rules,
        }
    }
}
