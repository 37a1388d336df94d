//! Connection lifecycle, transactions and the execute family.
//!
//! A [`ConnectionManager`] owns one lazily opened SQLite handle. Work against a
//! different data source goes through nested managers that mirror the owner's
//! open and transaction state and are torn down in reverse creation order.

use std::fmt;
use std::sync::Arc;
use std::thread::{self, ThreadId};

use crate::config::ConnectionSettings;
use crate::diagnostics::{DiagnosticsSink, LifecycleEvent, LifecycleKind, TracingSink};
use crate::error::ComposerError;

mod bulk;
mod command;
mod execute;
mod scope;
mod session;

pub use bulk::BulkInsertSettings;
pub use scope::{ConnectionScope, ScopeGuard};

use session::{Session, SharedSession, lock};

struct NestedEntry {
    key: String,
    manager: ConnectionManager,
    auto_opened: bool,
    auto_began: bool,
}

pub struct ConnectionManager {
    settings: ConnectionSettings,
    local: SharedSession,
    ambient: Option<ConnectionScope>,
    created_on: ThreadId,
    sink: Arc<dyn DiagnosticsSink>,
    nested: Vec<NestedEntry>,
}

impl ConnectionManager {
    #[must_use]
    pub fn new(settings: ConnectionSettings) -> Self {
        Self::with_sink(settings, Arc::new(TracingSink))
    }

    #[must_use]
    pub fn with_sink(settings: ConnectionSettings, sink: Arc<dyn DiagnosticsSink>) -> Self {
        let local = Session::shared(&settings, Arc::clone(&sink));
        Self {
            settings,
            local,
            ambient: None,
            created_on: thread::current().id(),
            sink,
            nested: Vec::new(),
        }
    }

    #[must_use]
    pub fn settings(&self) -> &ConnectionSettings {
        &self.settings
    }

    #[must_use]
    pub fn connection_string(&self) -> &str {
        &self.settings.connection_string
    }

    /// The session state is read from: the entered ambient scope when this
    /// manager opted into scopes, else its own.
    pub(crate) fn session(&self) -> &SharedSession {
        match &self.ambient {
            Some(scope) if self.settings.use_ambient_scope => &scope.session,
            _ => &self.local,
        }
    }

    pub(crate) fn check_thread(&self) -> Result<(), ComposerError> {
        if !self.settings.thread_safety_check {
            return Ok(());
        }
        let current = thread::current().id();
        if current == self.created_on {
            Ok(())
        } else {
            Err(ComposerError::ThreadSafetyViolation {
                created_on: format!("{:?}", self.created_on),
                called_from: format!("{current:?}"),
            })
        }
    }

    /// # Errors
    /// Returns `ComposerError::ThreadSafetyViolation` from a foreign thread, or
    /// `ComposerError::ConnectionError` if the database cannot be opened.
    pub fn open(&mut self) -> Result<(), ComposerError> {
        self.check_thread()?;
        lock(self.session()).open()
    }

    /// Close the handle unless it is kept open.
    ///
    /// Nested connections this manager opened on their own are closed first,
    /// newest first.
    ///
    /// # Errors
    /// Returns the first failure from closing a nested connection or the handle.
    pub fn close(&mut self) -> Result<(), ComposerError> {
        self.check_thread()?;
        if lock(self.session()).keep_open() {
            return Ok(());
        }
        for entry in self.nested.iter_mut().rev() {
            if entry.auto_opened {
                entry.auto_opened = false;
                entry.auto_began = false;
                entry.manager.close()?;
            }
        }
        lock(self.session()).close()
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        lock(self.session()).is_open()
    }

    #[must_use]
    pub fn keep_open(&self) -> bool {
        lock(self.session()).keep_open()
    }

    /// # Errors
    /// Returns `ComposerError::ThreadSafetyViolation` from a foreign thread.
    pub fn set_keep_open(&mut self, keep_open: bool) -> Result<(), ComposerError> {
        self.check_thread()?;
        lock(self.session()).set_keep_open(keep_open);
        Ok(())
    }

    #[must_use]
    pub fn in_transaction(&self) -> bool {
        lock(self.session()).in_transaction()
    }

    /// Begin a transaction at the configured isolation level, opening the handle if needed.
    ///
    /// # Errors
    /// Returns `ComposerError::ExecutionError` if a transaction is already active,
    /// or a provider error if `BEGIN` fails.
    pub fn begin_transaction(&mut self) -> Result<(), ComposerError> {
        self.check_thread()?;
        let mut session = lock(self.session());
        session.open()?;
        session.begin()
    }

    /// Commit nested transactions newest first, then this one.
    ///
    /// # Errors
    /// Returns `ComposerError::TransactionPoisoned` if a failed command detached the
    /// transaction, or the first commit failure.
    pub fn commit_transaction(&mut self) -> Result<(), ComposerError> {
        self.check_thread()?;
        let usable = {
            let mut session = lock(self.session());
            if session.in_transaction() {
                session.check_commit()
            } else {
                Ok(())
            }
        };
        if let Err(err) = usable {
            if let Err(nested) = self.rollback_nested() {
                tracing::warn!(error = %nested, "nested rollback after poisoned commit failed");
            }
            return Err(err);
        }
        for entry in self.nested.iter_mut().rev() {
            if entry.auto_began {
                entry.auto_began = false;
                entry.manager.commit_transaction()?;
            }
        }
        lock(self.session()).commit()
    }

    /// Roll back nested transactions newest first, then this one.
    ///
    /// Every rollback is attempted; the first failure is returned.
    ///
    /// # Errors
    /// Returns `ComposerError::ExecutionError` if no transaction is active, or the
    /// first rollback failure.
    pub fn rollback_transaction(&mut self) -> Result<(), ComposerError> {
        self.check_thread()?;
        let nested = self.rollback_nested();
        let primary = lock(self.session()).rollback();
        primary.and(nested)
    }

    fn rollback_nested(&mut self) -> Result<(), ComposerError> {
        let mut first_err = None;
        for entry in self.nested.iter_mut().rev() {
            if entry.auto_began {
                entry.auto_began = false;
                if let Err(err) = entry.manager.rollback_transaction() {
                    tracing::warn!(connection = %entry.key, error = %err, "nested rollback failed");
                    first_err.get_or_insert(err);
                }
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// A secondary manager for `connection_string`, cached unless `force_new`.
    ///
    /// The nested connection is opened and given a transaction when this one
    /// has them, and those are undone by this manager's close, commit and rollback.
    ///
    /// # Errors
    /// Returns a failure to open or begin on the nested connection.
    pub fn nested_connection(
        &mut self,
        connection_string: &str,
        force_new: bool,
    ) -> Result<&mut ConnectionManager, ComposerError> {
        self.check_thread()?;
        let existing = if force_new {
            None
        } else {
            self.nested.iter().position(|n| n.key == connection_string)
        };
        let idx = match existing {
            Some(idx) => idx,
            None => {
                let settings = ConnectionSettings {
                    connection_string: connection_string.to_string(),
                    keep_open: false,
                    use_ambient_scope: false,
                    ..self.settings.clone()
                };
                let manager = ConnectionManager::with_sink(settings, Arc::clone(&self.sink));
                tracing::debug!(owner = %self.settings.connection_string, connection = %connection_string, "nested connection created");
                self.sink.record(&LifecycleEvent {
                    kind: LifecycleKind::NestedCreated,
                    connection: connection_string.to_string(),
                });
                self.nested.push(NestedEntry {
                    key: connection_string.to_string(),
                    manager,
                    auto_opened: false,
                    auto_began: false,
                });
                self.nested.len() - 1
            }
        };

        let (open, in_transaction) = {
            let session = lock(self.session());
            (session.is_open(), session.in_transaction())
        };
        let entry = &mut self.nested[idx];
        if open && !entry.manager.is_open() {
            entry.manager.open()?;
            entry.auto_opened = true;
        }
        if in_transaction && !entry.manager.in_transaction() {
            entry.manager.begin_transaction()?;
            entry.auto_began = true;
        }
        Ok(&mut entry.manager)
    }

    #[must_use]
    pub fn nested_count(&self) -> usize {
        self.nested.len()
    }

    /// Share this manager's current session as a scope other managers can enter.
    #[must_use]
    pub fn scope(&self) -> ConnectionScope {
        ConnectionScope {
            session: Arc::clone(self.session()),
        }
    }

    /// Redirect this manager to `scope` until the returned guard is dropped.
    ///
    /// Only managers configured with `use_ambient_scope` follow the scope.
    ///
    /// # Errors
    /// Returns `ComposerError::ThreadSafetyViolation` from a foreign thread.
    pub fn enter_scope(&mut self, scope: &ConnectionScope) -> Result<ScopeGuard<'_>, ComposerError> {
        self.check_thread()?;
        Ok(ScopeGuard::enter(self, scope))
    }
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("connection_string", &self.settings.connection_string)
            .field("ambient", &self.ambient.is_some())
            .field("created_on", &self.created_on)
            .field("nested", &self.nested.len())
            .finish_non_exhaustive()
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        while let Some(entry) = self.nested.pop() {
            tracing::debug!(connection = %entry.key, "disposing nested connection");
            drop(entry);
        }
        // The local session rolls back and closes itself once no scope shares it.
    }
}
