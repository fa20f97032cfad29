use thiserror::Error;

use crate::transaction::SavepointId;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Table '{0}' already exists")]
    TableExists(String),

    #[error("Table '{0}' not found")]
    TableNotFound(String),

    #[error("Column '{0}' not found in table '{1}'")]
    ColumnNotFound(String, String),

    #[error("Type mismatch: {0}")]
    TypeMismatch(String),

    #[error("Execution error: {0}")]
    ExecutionError(String),

    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    #[error("Failed to acquire connection: {0}")]
    AcquisitionFailed(String),

    #[error("Connection pool timeout: no connections available")]
    PoolTimeout,

    #[error("A sandbox transaction is already active")]
    SessionActive,

    #[error("Sandbox session is closed")]
    SessionClosed,

    #[error("No active transaction")]
    NoActiveTransaction,

    #[error("Transaction {0} is already open on this connection")]
    TransactionAlreadyActive(SavepointId),

    #[error("Sandbox has been unpatched")]
    Unpatched,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Lock error: {0}")]
    LockError(String),

    #[error("I/O error: {0}")]
    IoError(String),

    #[cfg(feature = "postgres")]
    #[error("Postgres error: {0}")]
    Postgres(#[from] tokio_postgres::Error),
}

pub type Result<T> = std::result::Result<T, DbError>;

impl From<std::io::Error> for DbError {
    fn from(err: std::io::Error) -> Self {
        DbError::IoError(err.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for DbError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        DbError::LockError(err.to_string())
    }
}

impl DbError {
    /// SQLSTATE reported for this error over the wire.
    pub fn sqlstate(&self) -> &'static str {
        match self {
            Self::ParseError(_) => "42601",
            Self::TableExists(_) => "42P07",
            Self::TableNotFound(_) => "42P01",
            Self::ColumnNotFound(..) => "42703",
            Self::TypeMismatch(_) => "42804",
            Self::UnsupportedOperation(_) => "0A000",
            Self::AcquisitionFailed(_) | Self::PoolTimeout => "08006",
            Self::SessionClosed => "08003",
            Self::NoActiveTransaction => "25P01",
            Self::TransactionAlreadyActive(_) | Self::SessionActive => "25001",
            Self::Unpatched => "55000",
            _ => "XX000",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sqlstate_codes() {
        assert_eq!(DbError::TableNotFound("t".into()).sqlstate(), "42P01");
        assert_eq!(DbError::NoActiveTransaction.sqlstate(), "25P01");
        assert_eq!(DbError::AcquisitionFailed("refused".into()).sqlstate(), "08006");
        assert_eq!(DbError::ExecutionError("boom".into()).sqlstate(), "XX000");
    }

    #[test]
    fn test_display_names_savepoint() {
        let err = DbError::TransactionAlreadyActive(SavepointId(3));
        assert_eq!(err.to_string(), "Transaction sp_3 is already open on this connection");
    }
}
