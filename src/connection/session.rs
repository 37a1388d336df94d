use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use rusqlite::{Connection, ErrorCode, InterruptHandle};

use crate::config::{ConnectionSettings, IsolationLevel};
use crate::diagnostics::{DiagnosticsSink, LifecycleEvent, LifecycleKind};
use crate::error::ComposerError;

pub(crate) type SharedSession = Arc<Mutex<Session>>;

const ROLLBACK_BUSY_RETRIES: &[Duration] = &[
    Duration::from_millis(10),
    Duration::from_millis(25),
    Duration::from_millis(50),
];

pub(crate) fn lock(session: &SharedSession) -> MutexGuard<'_, Session> {
    session.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TransactionState {
    Active,
    /// A failed command left the native connection outside the transaction.
    Poisoned,
}

/// Native handle plus the transaction running on it.
///
/// A session is the unit that ambient scopes share between managers.
pub(crate) struct Session {
    connection_string: String,
    busy_timeout: Duration,
    isolation: IsolationLevel,
    wal: bool,
    keep_open: bool,
    conn: Option<Connection>,
    transaction: Option<TransactionState>,
    sink: Arc<dyn DiagnosticsSink>,
}

impl Session {
    pub(crate) fn new(settings: &ConnectionSettings, sink: Arc<dyn DiagnosticsSink>) -> Self {
        Self {
            connection_string: settings.connection_string.clone(),
            busy_timeout: settings.command_timeout(),
            isolation: settings.isolation_level,
            wal: settings.wal,
            keep_open: settings.keep_open,
            conn: None,
            transaction: None,
            sink,
        }
    }

    pub(crate) fn shared(settings: &ConnectionSettings, sink: Arc<dyn DiagnosticsSink>) -> SharedSession {
        Arc::new(Mutex::new(Self::new(settings, sink)))
    }

    pub(crate) fn connection_string(&self) -> &str {
        &self.connection_string
    }

    fn emit(&self, kind: LifecycleKind) {
        self.sink.record(&LifecycleEvent {
            kind,
            connection: self.connection_string.clone(),
        });
    }

    pub(crate) fn is_open(&self) -> bool {
        self.conn.is_some()
    }

    pub(crate) fn keep_open(&self) -> bool {
        self.keep_open
    }

    pub(crate) fn set_keep_open(&mut self, keep_open: bool) {
        self.keep_open = keep_open;
    }

    pub(crate) fn in_transaction(&self) -> bool {
        self.transaction.is_some()
    }

    pub(crate) fn connection(&self) -> Result<&Connection, ComposerError> {
        self.conn.as_ref().ok_or_else(|| {
            ComposerError::ConnectionError(format!("{} is not open", self.connection_string))
        })
    }

    pub(crate) fn interrupt_handle(&self) -> Option<InterruptHandle> {
        self.conn.as_ref().map(Connection::get_interrupt_handle)
    }

    pub(crate) fn open(&mut self) -> Result<(), ComposerError> {
        if self.conn.is_some() {
            return Ok(());
        }
        let conn = Connection::open(&self.connection_string).map_err(|e| {
            ComposerError::ConnectionError(format!("failed to open {}: {e}", self.connection_string))
        })?;
        conn.busy_timeout(self.busy_timeout)
            .map_err(|e| ComposerError::provider("PRAGMA busy_timeout", e))?;
        if self.wal {
            conn.execute_batch("PRAGMA journal_mode = WAL;")
                .map_err(|e| ComposerError::provider("PRAGMA journal_mode = WAL;", e))?;
        }
        self.conn = Some(conn);
        tracing::debug!(connection = %self.connection_string, "sqlite connection opened");
        self.emit(LifecycleKind::Opened);
        Ok(())
    }

    /// Close unless the session is pinned open.
    pub(crate) fn close(&mut self) -> Result<(), ComposerError> {
        if self.keep_open {
            return Ok(());
        }
        self.close_now()
    }

    /// Close regardless of `keep_open`, rolling back a transaction still running.
    pub(crate) fn close_now(&mut self) -> Result<(), ComposerError> {
        if self.conn.is_none() {
            return Ok(());
        }
        if self.transaction.is_some()
            && let Err(err) = self.rollback()
        {
            tracing::warn!(connection = %self.connection_string, error = %err, "rollback before close failed");
        }
        if let Some(conn) = self.conn.take() {
            conn.close().map_err(|(_, e)| {
                ComposerError::ConnectionError(format!(
                    "failed to close {}: {e}",
                    self.connection_string
                ))
            })?;
        }
        tracing::debug!(connection = %self.connection_string, "sqlite connection closed");
        self.emit(LifecycleKind::Closed);
        Ok(())
    }

    pub(crate) fn begin(&mut self) -> Result<(), ComposerError> {
        if self.transaction.is_some() {
            return Err(ComposerError::ExecutionError(format!(
                "a transaction is already active on {}",
                self.connection_string
            )));
        }
        let statement = self.isolation.begin_statement();
        self.connection()?
            .execute_batch(statement)
            .map_err(|e| ComposerError::provider(statement, e))?;
        self.transaction = Some(TransactionState::Active);
        tracing::debug!(connection = %self.connection_string, statement, "transaction begun");
        self.emit(LifecycleKind::TransactionBegun);
        Ok(())
    }

    /// Whether the native connection dropped out of the transaction on its own.
    fn detached(&self) -> bool {
        self.conn.as_ref().is_none_or(Connection::is_autocommit)
    }

    /// Fail if the active transaction can no longer be continued.
    pub(crate) fn ensure_usable(&mut self) -> Result<(), ComposerError> {
        if self.transaction.is_some() && self.detached() {
            self.transaction = Some(TransactionState::Poisoned);
        }
        if self.transaction == Some(TransactionState::Poisoned) {
            return Err(ComposerError::TransactionPoisoned(format!(
                "transaction on {} was detached by a failed command; roll back and begin a new one",
                self.connection_string
            )));
        }
        Ok(())
    }

    /// Like [`Session::ensure_usable`], but a poisoned transaction is also forgotten:
    /// nothing is left to commit or roll back natively.
    pub(crate) fn check_commit(&mut self) -> Result<(), ComposerError> {
        let usable = self.ensure_usable();
        if usable.is_err() {
            self.transaction = None;
        }
        usable
    }

    /// Record a failed command; poisons the transaction if the engine abandoned it.
    pub(crate) fn note_failure(&mut self) {
        if self.transaction == Some(TransactionState::Active) && self.detached() {
            tracing::warn!(connection = %self.connection_string, "failed command detached the active transaction");
            self.transaction = Some(TransactionState::Poisoned);
        }
    }

    pub(crate) fn commit(&mut self) -> Result<(), ComposerError> {
        if self.transaction.is_none() {
            return Err(ComposerError::ExecutionError(format!(
                "no active transaction on {}",
                self.connection_string
            )));
        }
        self.check_commit()?;
        self.connection()?
            .execute_batch("COMMIT")
            .map_err(|e| ComposerError::provider("COMMIT", e))?;
        self.transaction = None;
        tracing::debug!(connection = %self.connection_string, "transaction committed");
        self.emit(LifecycleKind::Committed);
        Ok(())
    }

    pub(crate) fn rollback(&mut self) -> Result<(), ComposerError> {
        if self.transaction.is_none() {
            return Err(ComposerError::ExecutionError(format!(
                "no active transaction on {}",
                self.connection_string
            )));
        }
        let result = if self.detached() {
            Ok(())
        } else {
            self.rollback_with_busy_retries()
        };
        self.transaction = None;
        tracing::debug!(connection = %self.connection_string, ok = result.is_ok(), "transaction rolled back");
        self.emit(LifecycleKind::RolledBack);
        result
    }

    fn rollback_with_busy_retries(&self) -> Result<(), ComposerError> {
        let conn = self.connection()?;
        for (idx, delay) in ROLLBACK_BUSY_RETRIES.iter().copied().enumerate() {
            match conn.execute_batch("ROLLBACK") {
                Ok(()) => return Ok(()),
                Err(rusqlite::Error::SqliteFailure(err, _))
                    if err.code == ErrorCode::DatabaseBusy
                        && idx + 1 < ROLLBACK_BUSY_RETRIES.len() =>
                {
                    thread::sleep(delay);
                }
                Err(e) => return Err(ComposerError::provider("ROLLBACK", e)),
            }
        }
        Err(ComposerError::ExecutionError("rollback retries exhausted".into()))
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Err(err) = self.close_now() {
            tracing::warn!(connection = %self.connection_string, error = %err, "closing dropped session failed");
        }
    }
}
