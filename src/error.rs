use thiserror::Error;

use rusqlite::ErrorCode;

#[derive(Debug, Error)]
pub enum ComposerError {
    #[error("Parameter name conflict: {name} is bound as {existing} but was re-bound as {requested}")]
    NameConflict {
        name: String,
        existing: String,
        requested: String,
    },

    #[error("Thread safety violation: connection created on {created_on} was used from {called_from}")]
    ThreadSafetyViolation {
        created_on: String,
        called_from: String,
    },

    #[error("Transaction poisoned: {0}")]
    TransactionPoisoned(String),

    #[error("Provider error: {source} (query: {query})")]
    Provider {
        query: String,
        #[source]
        source: rusqlite::Error,
    },

    #[error("Process canceled")]
    ProcessCanceled,

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Parameter error: {0}")]
    ParameterError(String),

    #[error("SQL execution error: {0}")]
    ExecutionError(String),

    #[error("Unimplemented feature: {0}")]
    Unimplemented(String),
}

impl ComposerError {
    /// Wrap a native engine failure together with the text that caused it.
    pub fn provider(query: impl Into<String>, source: rusqlite::Error) -> Self {
        ComposerError::Provider {
            query: query.into(),
            source,
        }
    }

    /// Whether the failure is a lock/busy condition a caller may choose to retry.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            ComposerError::Provider {
                source: rusqlite::Error::SqliteFailure(err, _),
                ..
            } => matches!(
                err.code,
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }

    /// Whether the native engine reported the command as interrupted.
    #[must_use]
    pub fn is_interrupt(&self) -> bool {
        matches!(
            self,
            ComposerError::Provider {
                source: rusqlite::Error::SqliteFailure(err, _),
                ..
            } if err.code == ErrorCode::OperationInterrupted
        )
    }

    /// The query text attached to a provider failure.
    #[must_use]
    pub fn query(&self) -> Option<&str> {
        match self {
            ComposerError::Provider { query, .. } => Some(query),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for ComposerError {
    fn from(err: serde_json::Error) -> Self {
        ComposerError::ConfigError(format!("invalid settings document: {err}"))
    }
}

impl From<tokio::task::JoinError> for ComposerError {
    fn from(err: tokio::task::JoinError) -> Self {
        ComposerError::ExecutionError(format!("sqlite spawn_blocking join error: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failure(code: ErrorCode) -> rusqlite::Error {
        rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error {
                code,
                extended_code: 0,
            },
            None,
        )
    }

    #[test]
    fn busy_and_locked_are_transient() {
        assert!(ComposerError::provider("select 1", failure(ErrorCode::DatabaseBusy)).is_transient());
        assert!(ComposerError::provider("select 1", failure(ErrorCode::DatabaseLocked)).is_transient());
        assert!(!ComposerError::provider("select 1", failure(ErrorCode::ConstraintViolation)).is_transient());
        assert!(!ComposerError::ProcessCanceled.is_transient());
    }

    #[test]
    fn provider_error_keeps_query_text() {
        let err = ComposerError::provider("SELECT * FROM missing", failure(ErrorCode::Unknown));
        assert_eq!(err.query(), Some("SELECT * FROM missing"));
        assert!(err.to_string().contains("SELECT * FROM missing"));
    }
}
