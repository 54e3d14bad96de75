use thiserror::Error;

use crate::rpc::Retryable;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("Pool error: {0}")]
    PoolError(#[from] deadpool_postgres::PoolError),

    #[error("{}", format_pg_error(.0))]
    PostgresError(#[from] tokio_postgres::Error),

    #[error("Build error: {0}")]
    BuildError(#[from] deadpool_postgres::BuildError),

    #[error("Invalid connection string: {0}")]
    InvalidConnectionString(String),

    #[error("Cannot merge column '{column}' of '{table}': {reason}")]
    MergeError {
        table: String,
        column: String,
        reason: String,
    },

    #[error("Invalid row in '{table}': {reason}")]
    InvalidRow { table: String, reason: String },

    #[error("Unsupported by this store: {0}")]
    Unsupported(String),

    #[error("Transaction already finished")]
    TransactionFinished,
}

impl Retryable for DbError {
    fn is_retryable(&self) -> bool {
        match self {
            DbError::PoolError(_) | DbError::PostgresError(_) | DbError::TransactionFinished => true,
            DbError::BuildError(_)
            | DbError::InvalidConnectionString(_)
            | DbError::MergeError { .. }
            | DbError::InvalidRow { .. }
            | DbError::Unsupported(_) => false,
        }
    }
}

fn format_pg_error(e: &tokio_postgres::Error) -> String {
    if let Some(db_err) = e.as_db_error() {
        let mut msg = format!(
            "PostgreSQL error [{}]: {}",
            db_err.code().code(),
            db_err.message()
        );
        if let Some(detail) = db_err.detail() {
            msg.push_str(&format!("\n  Detail: {}", detail));
        }
        if let Some(hint) = db_err.hint() {
            msg.push_str(&format!("\n  Hint: {}", hint));
        }
        if let Some(table) = db_err.table() {
            msg.push_str(&format!("\n  Table: {}", table));
        }
        if let Some(constraint) = db_err.constraint() {
            msg.push_str(&format!("\n  Constraint: {}", constraint));
        }
        msg
    } else {
        format!("PostgreSQL error: {}", e)
    }
}
