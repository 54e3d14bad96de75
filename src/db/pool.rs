use async_trait::async_trait;
use bytes::BytesMut;
use deadpool_postgres::{Manager, ManagerConfig, Object, Pool, RecyclingMethod, Runtime};
use serde_json::Value as JsonValue;
use tokio_postgres::types::{IsNull, ToSql, Type};
use tokio_postgres::NoTls;

use super::error::DbError;
use super::store::{Filters, ProjectionStore, StateTransaction};
use super::types::{address_hex, DbOperation, DbValue, MergeRule};

/// PostgreSQL-backed [`ProjectionStore`]. Each batch transaction holds one
/// pooled connection from `BEGIN` to `COMMIT`.
pub struct DbPool {
    pool: Pool,
}

impl DbPool {
    /// Build the pool and check that the database answers.
    pub async fn new(database_url: &str, max_size: usize) -> Result<Self, DbError> {
        let pg_config: tokio_postgres::Config = database_url
            .parse()
            .map_err(|e: tokio_postgres::Error| DbError::InvalidConnectionString(e.to_string()))?;

        let manager = Manager::from_config(
            pg_config,
            NoTls,
            ManagerConfig {
                recycling_method: RecyclingMethod::Fast,
            },
        );
        let pool = Pool::builder(manager)
            .max_size(max_size.max(1))
            .runtime(Runtime::Tokio1)
            .build()
            .map_err(DbError::BuildError)?;

        pool.get().await?.batch_execute("SELECT 1").await?;
        tracing::info!("Connected to PostgreSQL (pool size {})", max_size.max(1));

        Ok(Self { pool })
    }
}

#[async_trait]
impl ProjectionStore for DbPool {
    async fn begin(&self) -> Result<Box<dyn StateTransaction>, DbError> {
        let client = self.pool.get().await?;
        client.batch_execute("BEGIN").await?;
        Ok(Box::new(PgTransaction {
            client: Some(client),
        }))
    }

    async fn execute_schema(&self, statement: &str) -> Result<(), DbError> {
        let client = self.pool.get().await?;
        client.batch_execute(statement).await?;
        Ok(())
    }

    async fn select(
        &self,
        table: &str,
        filters: &Filters<'_>,
    ) -> Result<Vec<JsonValue>, DbError> {
        let statement = Statement::select(table, filters, None);
        let client = self.pool.get().await?;
        let rows = client.query(&statement.sql, &statement.params()).await?;
        rows.iter()
            .map(|row| row.try_get::<_, JsonValue>(0).map_err(DbError::from))
            .collect()
    }
}

/// A pooled connection with an open `BEGIN`. Dropping it without commit or
/// rollback rolls back in the background before the connection is recycled.
pub struct PgTransaction {
    client: Option<Object>,
}

impl PgTransaction {
    fn client(&self) -> Result<&Object, DbError> {
        self.client.as_ref().ok_or(DbError::TransactionFinished)
    }

    async fn finish(&mut self, statement: &str) -> Result<(), DbError> {
        let client = self.client.take().ok_or(DbError::TransactionFinished)?;
        client.batch_execute(statement).await?;
        Ok(())
    }
}

#[async_trait]
impl StateTransaction for PgTransaction {
    async fn execute(&mut self, op: &DbOperation) -> Result<(), DbError> {
        let statement = Statement::write(op);
        if let Err(e) = self.client()?.execute(&statement.sql, &statement.params()).await {
            let e = DbError::from(e);
            tracing::error!("Write to {} failed: {}\n  SQL: {}", op.table(), e, statement.sql);
            return Err(e);
        }
        Ok(())
    }

    async fn query_one(
        &mut self,
        table: &str,
        filters: &Filters<'_>,
    ) -> Result<Option<JsonValue>, DbError> {
        let statement = Statement::select(table, filters, Some(1));
        let row = self.client()?.query_opt(&statement.sql, &statement.params()).await?;
        row.map(|r| r.try_get::<_, JsonValue>(0))
            .transpose()
            .map_err(DbError::from)
    }

    async fn commit(self: Box<Self>) -> Result<(), DbError> {
        let mut this = self;
        this.finish("COMMIT").await
    }

    async fn rollback(self: Box<Self>) -> Result<(), DbError> {
        let mut this = self;
        this.finish("ROLLBACK").await
    }
}

impl Drop for PgTransaction {
    fn drop(&mut self) {
        let Some(client) = self.client.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = client.batch_execute("ROLLBACK").await {
                        tracing::warn!("Rollback of abandoned transaction failed: {}", e);
                    }
                });
            }
            Err(_) => {
                tracing::warn!("Dropping open transaction outside of a runtime");
            }
        }
    }
}

/// Parameter as sent to PostgreSQL. Addresses travel as lowercase text and
/// numerics as decimal text cast server-side.
#[derive(Debug)]
enum PgParam {
    Null,
    Bool(bool),
    Int4(i32),
    Int8(i64),
    Text(String),
    Bytea(Vec<u8>),
    Jsonb(JsonValue),
}

impl From<&DbValue> for PgParam {
    fn from(value: &DbValue) -> Self {
        match value {
            DbValue::Null => PgParam::Null,
            DbValue::Bool(v) => PgParam::Bool(*v),
            DbValue::Int32(v) => PgParam::Int4(*v),
            DbValue::Int64(v) => PgParam::Int8(*v),
            DbValue::Uint64(v) => match i64::try_from(*v) {
                Ok(v) => PgParam::Int8(v),
                Err(_) => PgParam::Text(v.to_string()),
            },
            DbValue::Text(v) | DbValue::Numeric(v) => PgParam::Text(v.clone()),
            DbValue::Address(v) => PgParam::Text(address_hex(v)),
            DbValue::Bytes(v) => PgParam::Bytea(v.clone()),
            DbValue::Bytes32(v) => PgParam::Bytea(v.to_vec()),
            DbValue::Json(v) => PgParam::Jsonb(v.clone()),
        }
    }
}

impl ToSql for PgParam {
    fn to_sql(
        &self,
        ty: &Type,
        out: &mut BytesMut,
    ) -> Result<IsNull, Box<dyn std::error::Error + Sync + Send>> {
        match self {
            PgParam::Null => Ok(IsNull::Yes),
            PgParam::Bool(v) => v.to_sql(ty, out),
            PgParam::Int4(v) => v.to_sql(ty, out),
            PgParam::Int8(v) => v.to_sql(ty, out),
            PgParam::Text(v) => v.to_sql(ty, out),
            PgParam::Bytea(v) => v.to_sql(ty, out),
            PgParam::Jsonb(v) => v.to_sql(ty, out),
        }
    }

    fn accepts(ty: &Type) -> bool {
        <bool as ToSql>::accepts(ty)
            || <i32 as ToSql>::accepts(ty)
            || <i64 as ToSql>::accepts(ty)
            || <String as ToSql>::accepts(ty)
            || <Vec<u8> as ToSql>::accepts(ty)
            || <JsonValue as ToSql>::accepts(ty)
    }

    tokio_postgres::types::to_sql_checked!();
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn column_list(columns: &[String]) -> String {
    columns.iter().map(|c| quote_ident(c)).collect::<Vec<_>>().join(", ")
}

/// SQL text with its positional parameters, bound while the text is built.
#[derive(Debug, Default)]
struct Statement {
    sql: String,
    params: Vec<PgParam>,
}

impl Statement {
    fn write(op: &DbOperation) -> Self {
        match op {
            DbOperation::Upsert {
                table,
                columns,
                values,
                conflict_columns,
                update_columns,
            } => {
                let assignments: Vec<String> = update_columns
                    .iter()
                    .map(|c| format!("{0} = EXCLUDED.{0}", quote_ident(c)))
                    .collect();
                Self::insert_on_conflict(table, columns, values, conflict_columns, &assignments)
            }
            DbOperation::Merge {
                table,
                columns,
                values,
                conflict_columns,
                rules,
            } => {
                let assignments: Vec<String> = rules
                    .iter()
                    .filter_map(|(column, rule)| merge_assignment(column, *rule))
                    .collect();
                Self::insert_on_conflict(table, columns, values, conflict_columns, &assignments)
            }
        }
    }

    /// `INSERT .. ON CONFLICT`, with the stored row aliased as `cur` for the
    /// assignments. No assignments means `DO NOTHING`.
    fn insert_on_conflict(
        table: &str,
        columns: &[String],
        values: &[DbValue],
        conflict_columns: &[String],
        assignments: &[String],
    ) -> Self {
        let mut statement = Self::default();
        let placeholders: Vec<String> = values.iter().map(|v| statement.bind(v)).collect();
        let action = if assignments.is_empty() {
            "DO NOTHING".to_string()
        } else {
            format!("DO UPDATE SET {}", assignments.join(", "))
        };
        statement.sql = format!(
            "INSERT INTO {} AS cur ({}) VALUES ({}) ON CONFLICT ({}) {}",
            table,
            column_list(columns),
            placeholders.join(", "),
            column_list(conflict_columns),
            action
        );
        statement
    }

    fn select(table: &str, filters: &Filters<'_>, limit: Option<usize>) -> Self {
        let mut statement = Self::default();
        let conditions: Vec<String> = filters
            .iter()
            .map(|(column, value)| {
                if value.is_null() {
                    format!("{} IS NULL", quote_ident(column))
                } else {
                    format!("{} = {}", quote_ident(column), statement.bind(value))
                }
            })
            .collect();

        let mut sql = format!("SELECT {} FROM {} t", row_json(table), table);
        if !conditions.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&conditions.join(" AND "));
        }
        if let Some(limit) = limit {
            sql.push_str(&format!(" LIMIT {}", limit));
        }
        statement.sql = sql;
        statement
    }

    /// Push `value` and return its placeholder.
    fn bind(&mut self, value: &DbValue) -> String {
        self.params.push(PgParam::from(value));
        let index = self.params.len();
        match value {
            DbValue::Numeric(_) => format!("${}::text::numeric", index),
            DbValue::Uint64(v) if i64::try_from(*v).is_err() => {
                format!("${}::text::numeric", index)
            }
            _ => format!("${}", index),
        }
    }

    fn params(&self) -> Vec<&(dyn ToSql + Sync)> {
        self.params.iter().map(|p| p as &(dyn ToSql + Sync)).collect()
    }
}

/// `to_jsonb` of the row aliased `t`, with NUMERIC columns rendered as
/// decimal strings. serde_json would otherwise parse them as `f64`.
fn row_json(table: &str) -> String {
    format!(
        "(SELECT jsonb_object_agg(f.key, CASE WHEN a.atttypid = 'numeric'::regtype \
         THEN to_jsonb(f.value #>> '{{}}') ELSE f.value END) \
         FROM jsonb_each(to_jsonb(t)) f \
         JOIN pg_attribute a ON a.attrelid = '{}'::regclass AND a.attname = f.key)",
        table
    )
}

fn merge_assignment(column: &str, rule: MergeRule) -> Option<String> {
    let c = quote_ident(column);
    let expr = match rule {
        MergeRule::Replace => format!("EXCLUDED.{}", c),
        MergeRule::Add => format!("COALESCE(cur.{0}, 0) + EXCLUDED.{0}", c),
        MergeRule::Max => format!("GREATEST(cur.{0}, EXCLUDED.{0})", c),
        MergeRule::Min => format!("LEAST(cur.{0}, EXCLUDED.{0})", c),
        MergeRule::KeepExisting => return None,
    };
    Some(format!("{} = {}", c, expr))
}
