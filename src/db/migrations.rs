//! Schema setup run once before any chain starts ingesting.
//!
//! There is no version table: every statement is re-applied on every start,
//! so each one must be idempotent (`CREATE TABLE IF NOT EXISTS`, ...).

use std::sync::Arc;

use thiserror::Error;

use super::error::DbError;
use super::internal::{load_reset_count, reset_count_operation, INTERNAL_SCHEMA, RESET_STATEMENTS};
use super::store::ProjectionStore;

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("Migration '{name}' failed at statement {index}: {source}")]
    StatementFailed {
        name: String,
        index: usize,
        #[source]
        source: DbError,
    },

    #[error("Recording reset {requested} failed: {source}")]
    ResetFailed {
        requested: u64,
        #[source]
        source: DbError,
    },
}

/// Idempotent schema statements owned by one contract type's handlers.
pub trait StateMigrations: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Statements, applied in order.
    fn migrations(&self) -> Vec<&'static str>;

    /// Statements undoing [`migrations`](Self::migrations) on a reset. By
    /// default every `CREATE TABLE` is dropped.
    fn reset_migrations(&self) -> Vec<String> {
        self.migrations()
            .iter()
            .filter_map(|sql| created_table(sql))
            .map(|table| format!("DROP TABLE IF EXISTS {}", table))
            .collect()
    }
}

fn created_table(statement: &str) -> Option<&str> {
    let statement = statement.trim_start();
    let rest = statement
        .strip_prefix("CREATE TABLE IF NOT EXISTS ")
        .or_else(|| statement.strip_prefix("CREATE TABLE "))?;
    rest.split(|c: char| c.is_whitespace() || c == '(')
        .find(|part| !part.is_empty())
}

#[derive(Default, Clone)]
pub struct MigrationRunner {
    migrations: Vec<Arc<dyn StateMigrations>>,
}

impl MigrationRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, migrations: Arc<dyn StateMigrations>) {
        if self.migrations.iter().any(|m| m.name() == migrations.name()) {
            tracing::debug!("Migration set {} already registered", migrations.name());
            return;
        }
        self.migrations.push(migrations);
    }

    pub fn len(&self) -> usize {
        self.migrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.migrations.is_empty()
    }

    /// Apply the engine's own tables, then every registered migration set in
    /// registration order. Stops at the first failing statement.
    pub async fn run(&self, store: &dyn ProjectionStore) -> Result<(), MigrationError> {
        apply_statements(store, "internal", INTERNAL_SCHEMA.iter().copied()).await?;

        for set in &self.migrations {
            let statements = set.migrations();
            let count = statements.len();
            apply_statements(store, set.name(), statements.into_iter()).await?;
            tracing::info!("Applied {} statements for {}", count, set.name());
        }

        tracing::info!("All migrations applied");
        Ok(())
    }

    /// Start over when `requested` is above the reset count stored in the
    /// database: drop the tables of every migration set, clear the cursors
    /// and dynamic registrations, then record `requested`. Returns whether
    /// anything was reset.
    pub async fn reset(
        &self,
        store: &dyn ProjectionStore,
        requested: u64,
    ) -> Result<bool, MigrationError> {
        apply_statements(store, "internal", INTERNAL_SCHEMA.iter().copied()).await?;
        let failed = |source: DbError| MigrationError::ResetFailed { requested, source };

        let recorded = load_reset_count(store).await.map_err(failed)?;
        if requested <= recorded {
            return Ok(false);
        }

        for set in &self.migrations {
            let statements = set.reset_migrations();
            apply_statements(store, set.name(), statements.iter().map(String::as_str)).await?;
        }
        apply_statements(store, "internal", RESET_STATEMENTS.iter().copied()).await?;

        let mut tx = store.begin().await.map_err(failed)?;
        tx.execute(&reset_count_operation(requested)).await.map_err(failed)?;
        tx.commit().await.map_err(failed)?;

        tracing::warn!(
            "Reset {} applied (was {}): projections, cursors and registrations dropped",
            requested,
            recorded
        );
        Ok(true)
    }
}

async fn apply_statements<'a>(
    store: &dyn ProjectionStore,
    name: &str,
    statements: impl Iterator<Item = &'a str>,
) -> Result<(), MigrationError> {
    for (index, sql) in statements.enumerate() {
        store
            .execute_schema(sql)
            .await
            .map_err(|source| MigrationError::StatementFailed {
                name: name.to_string(),
                index,
                source,
            })?;
    }
    Ok(())
}
