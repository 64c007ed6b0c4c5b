//! Error type shared by every session.

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub type OrmResult<T> = Result<T, OrmError>;

/// Everything a session can record.
///
/// Errors are `Clone` because sessions carry them forward along a chain:
/// every derived session inherits the error list of its parent.
#[derive(Debug, Clone, Error)]
pub enum OrmError {
    #[error("connection failed: {0}")]
    Connection(String),

    /// A statement failed server-side or on the wire.
    #[error("query failed: {0}")]
    Query(Arc<tokio_postgres::Error>),

    /// A single-valued read matched no rows.
    #[error("record not found")]
    RecordNotFound,

    /// SQLSTATE 23505.
    #[error("unique violation: {0}")]
    UniqueViolation(String),

    /// SQLSTATE 23503.
    #[error("foreign key violation: {0}")]
    ForeignKeyViolation(String),

    /// SQLSTATE 23514.
    #[error("check violation: {0}")]
    CheckViolation(String),

    #[error("cannot decode column {column:?}: {message}")]
    Decode { column: String, message: String },

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("serialization failed: {0}")]
    Serialization(String),

    #[error("pool: {0}")]
    Pool(String),

    #[error("statement timed out after {0:?}")]
    Timeout(Duration),

    /// UPDATE/DELETE without conditions while global updates are blocked.
    #[error("missing WHERE clause while {0}")]
    MissingWhereClause(&'static str),

    /// Commit/rollback outside a transaction, or use of a finished one.
    #[error("invalid transaction: {0}")]
    InvalidTransaction(String),

    /// Bad placeholders or identifiers.
    #[error("invalid SQL: {0}")]
    InvalidSql(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Several errors accumulated by one session, oldest first.
    #[error("{}", join_errors(.0))]
    Multiple(Vec<OrmError>),

    #[error("{0}")]
    Other(String),
}

fn join_errors(errors: &[OrmError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl OrmError {
    pub fn decode(column: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Decode {
            column: column.into(),
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization(message.into())
    }

    pub fn is_unique_violation(&self) -> bool {
        matches!(self, Self::UniqueViolation(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::RecordNotFound)
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }

    /// Map constraint SQLSTATEs onto their variants; everything else is `Query`.
    pub fn from_db_error(err: tokio_postgres::Error) -> Self {
        let Some(db) = err.as_db_error() else {
            return Self::Query(Arc::new(err));
        };
        let detail = format!("{}: {}", db.constraint().unwrap_or("unknown"), db.message());
        let state = db.code().clone();
        match state.code() {
            "23505" => Self::UniqueViolation(detail),
            "23503" => Self::ForeignKeyViolation(detail),
            "23514" => Self::CheckViolation(detail),
            _ => Self::Query(Arc::new(err)),
        }
    }

    /// Combine an ordered error list into the single error a session reports.
    pub(crate) fn combine(errors: &[OrmError]) -> Option<OrmError> {
        match errors {
            [] => None,
            [only] => Some(only.clone()),
            many => Some(Self::Multiple(many.to_vec())),
        }
    }
}

impl From<tokio_postgres::Error> for OrmError {
    fn from(err: tokio_postgres::Error) -> Self {
        Self::from_db_error(err)
    }
}

impl From<serde_json::Error> for OrmError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<deadpool_postgres::PoolError> for OrmError {
    fn from(err: deadpool_postgres::PoolError) -> Self {
        Self::Pool(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn combine_keeps_single_error_as_is() {
        let combined = OrmError::combine(&[OrmError::RecordNotFound]).unwrap();
        assert!(combined.is_not_found());
        assert!(OrmError::combine(&[]).is_none());
    }

    #[test]
    fn multiple_joins_messages_in_order() {
        let combined = OrmError::combine(&[
            OrmError::RecordNotFound,
            OrmError::validation("bad input"),
        ])
        .unwrap();
        assert_eq!(
            combined.to_string(),
            "record not found; validation failed: bad input"
        );
    }
}
